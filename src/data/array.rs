//! Two-dimensional sample arrays indexed as `[channel, sample]`.

use crate::error::{AppResult, VscopeError};
use serde::{Deserialize, Serialize};

/// Samples of every channel of one device, stored channel by channel.
///
/// Serialized as a list of per-channel lists. Finite samples are JSON numbers; NaN and the
/// infinities are the strings `"nan"`, `"inf"` and `"-inf"`. `null` reads back as NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<StoredSample>>", into = "Vec<Vec<StoredSample>>")]
pub struct ChannelData {
    channels: usize,
    samples: usize,
    values: Vec<f32>,
}

impl ChannelData {
    /// Build from per-channel rows, which must all have the same length.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> AppResult<Self> {
        let channels = rows.len();
        let samples = rows.first().map_or(0, Vec::len);
        if let Some(row) = rows.iter().find(|row| row.len() != samples) {
            return Err(VscopeError::ShapeMismatch {
                expected: (channels, samples),
                actual: (channels, row.len()),
            });
        }
        Ok(Self {
            channels,
            samples,
            values: rows.into_iter().flatten().collect(),
        })
    }

    /// Build from sample-major values, as downloaded: every sample carries one value per channel.
    pub fn from_interleaved(values: &[f32], samples: usize, channels: usize) -> AppResult<Self> {
        if values.len() != samples * channels {
            let actual_samples = if channels == 0 { 0 } else { values.len() / channels };
            return Err(VscopeError::ShapeMismatch {
                expected: (channels, samples),
                actual: (channels, actual_samples),
            });
        }
        let mut transposed = Vec::with_capacity(values.len());
        for channel in 0..channels {
            transposed.extend((0..samples).map(|sample| values[sample * channels + channel]));
        }
        Ok(Self {
            channels,
            samples,
            values: transposed,
        })
    }

    /// A `channels` x `samples` array filled with NaN.
    pub fn nan(channels: usize, samples: usize) -> Self {
        Self {
            channels,
            samples,
            values: vec![f32::NAN; channels * samples],
        }
    }

    /// `(channels, samples)`
    pub fn shape(&self) -> (usize, usize) {
        (self.channels, self.samples)
    }

    /// Samples of one channel.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        (index < self.channels)
            .then(|| &self.values[index * self.samples..(index + 1) * self.samples])
    }

    /// Iterate over the channels.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        (0..self.channels).filter_map(move |index| self.channel(index))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredSample {
    Number(f32),
    Token(String),
    Missing(()),
}

impl StoredSample {
    fn encode(value: f32) -> Self {
        if value.is_finite() {
            Self::Number(value)
        } else if value.is_nan() {
            Self::Token("nan".to_string())
        } else if value > 0.0 {
            Self::Token("inf".to_string())
        } else {
            Self::Token("-inf".to_string())
        }
    }

    fn decode(self) -> AppResult<f32> {
        match self {
            Self::Number(value) => Ok(value),
            Self::Missing(()) => Ok(f32::NAN),
            Self::Token(token) => match token.as_str() {
                "nan" => Ok(f32::NAN),
                "inf" => Ok(f32::INFINITY),
                "-inf" => Ok(f32::NEG_INFINITY),
                _ => Err(VscopeError::CorruptCache(format!(
                    "unexpected sample value {token:?}"
                ))),
            },
        }
    }
}

impl TryFrom<Vec<Vec<StoredSample>>> for ChannelData {
    type Error = VscopeError;

    fn try_from(rows: Vec<Vec<StoredSample>>) -> Result<Self, Self::Error> {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(StoredSample::decode).collect())
            .collect::<AppResult<Vec<Vec<f32>>>>()?;
        Self::from_rows(rows)
    }
}

impl From<ChannelData> for Vec<Vec<StoredSample>> {
    fn from(data: ChannelData) -> Self {
        data.rows()
            .map(|row| row.iter().copied().map(StoredSample::encode).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_download_is_transposed() {
        // two samples of three channels
        let data = ChannelData::from_interleaved(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        assert_eq!(data.shape(), (3, 2));
        assert_eq!(data.channel(0), Some(&[1.0, 4.0][..]));
        assert_eq!(data.channel(2), Some(&[3.0, 6.0][..]));
        assert_eq!(data.channel(3), None);
    }

    #[test]
    fn wrong_length_is_a_shape_mismatch() {
        let err = ChannelData::from_interleaved(&[1.0, 2.0, 3.0], 2, 2).unwrap_err();
        assert!(matches!(err, VscopeError::ShapeMismatch { .. }));
        assert!(ChannelData::from_rows(vec![vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn non_finite_samples_survive_json() {
        let data =
            ChannelData::from_rows(vec![vec![1.5, f32::NAN, f32::INFINITY, f32::NEG_INFINITY]])
                .unwrap();
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(json, r#"[[1.5,"nan","inf","-inf"]]"#);

        let back: ChannelData = serde_json::from_str(&json).unwrap();
        let samples = back.channel(0).unwrap();
        assert_eq!(samples[0], 1.5);
        assert!(samples[1].is_nan());
        assert_eq!(samples[2], f32::INFINITY);
        assert_eq!(samples[3], f32::NEG_INFINITY);
    }

    #[test]
    fn null_samples_read_as_nan() {
        let back: ChannelData = serde_json::from_str("[[2.0,null]]").unwrap();
        assert_eq!(back.channel(0).unwrap()[0], 2.0);
        assert!(back.channel(0).unwrap()[1].is_nan());
        assert!(serde_json::from_str::<ChannelData>(r#"[["loud"]]"#).is_err());
    }
}
