//! Frame encoding for the acquisition consumer.
//!
//! A frame carries `num_samples` packets. Each packet is routed from the physical channel
//! order to the logical one, notch filtered per channel, extended with two status channels
//! and clamped to `u16`. Samples are laid out channel-major behind a 22-byte little-endian
//! header:
//!
//! | field            | type | value                                |
//! |------------------|------|--------------------------------------|
//! | offset           | i32  | 0                                    |
//! | bytes per buffer | i32  | channels * samples * 2               |
//! | data type        | i16  | 2 (u16)                              |
//! | element size     | i32  | 2                                    |
//! | channel count    | i32  | data channels + 2                    |
//! | sample count     | i32  | samples per channel                  |

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type};
use bytes::{BufMut, Bytes, BytesMut};

use crate::config::{ChannelRoute, StreamConfig};
use crate::error::{AppResult, ViperError};
use crate::hardware::Packet;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 22;
/// Data type code for unsigned 16-bit samples.
pub const DATA_TYPE_U16: i16 = 2;
/// Status channels appended after the data channels.
pub const STATUS_CHANNELS: usize = 2;

/// Linear map from physical channels to logical channels.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingMatrix {
    weights: Vec<Vec<f64>>,
}

impl RoutingMatrix {
    /// Route physical channel `k` to logical channel `k` for every `k < outputs`.
    pub fn identity(outputs: usize, inputs: usize) -> Self {
        let weights = (0..outputs)
            .map(|row| (0..inputs).map(|col| if row == col { 1.0 } else { 0.0 }).collect())
            .collect();
        Self { weights }
    }

    /// Build the matrix from 1-indexed channel routes.
    ///
    /// Each logical channel is fed by at most one physical channel and each physical
    /// channel feeds at most one logical channel. Logical channels without a route stay
    /// zero. No routes at all means [`RoutingMatrix::identity`].
    pub fn from_routes(
        outputs: usize,
        inputs: usize,
        routes: &[ChannelRoute],
    ) -> Result<Self, String> {
        if routes.is_empty() {
            return Ok(Self::identity(outputs, inputs));
        }

        let mut weights = vec![vec![0.0; inputs]; outputs];
        let mut used_inputs = vec![false; inputs];
        for route in routes {
            let (channel, electrode) = (route.channel, route.electrode);
            if !(1..=inputs).contains(&channel) {
                return Err(format!(
                    "stream.mapping channel {channel} must be between 1 and {inputs}"
                ));
            }
            if !(1..=outputs).contains(&electrode) {
                return Err(format!(
                    "stream.mapping electrode {electrode} must be between 1 and {outputs}"
                ));
            }
            if used_inputs[channel - 1] {
                return Err(format!("stream.mapping routes channel {channel} twice"));
            }
            let row = &mut weights[electrode - 1];
            if row.iter().any(|w| *w != 0.0) {
                return Err(format!("stream.mapping feeds electrode {electrode} twice"));
            }
            row[channel - 1] = 1.0;
            used_inputs[channel - 1] = true;
        }
        Ok(Self { weights })
    }

    pub fn outputs(&self) -> usize {
        self.weights.len()
    }

    /// Apply to one packet; physical channels beyond `input` are treated as zero.
    pub fn apply(&self, input: &[f64], output: &mut Vec<f64>) {
        output.clear();
        for row in &self.weights {
            let value = row
                .iter()
                .zip(input)
                .filter(|(w, _)| **w != 0.0)
                .map(|(w, x)| w * x)
                .sum();
            output.push(value);
        }
    }
}

/// Clamp a filtered sample into the `u16` range.
pub fn clamp_sample(value: f64) -> u16 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Stateful encoder; filter state carries over from one frame to the next.
pub struct FrameEncoder {
    num_samples: usize,
    input_channels: usize,
    routing: Option<RoutingMatrix>,
    filters: Vec<DirectForm2Transposed<f64>>,
}

impl FrameEncoder {
    pub fn new(config: &StreamConfig) -> AppResult<Self> {
        let coefficients = Coefficients::<f64>::from_params(
            Type::Notch,
            config.sample_rate.hz(),
            config.notch_f0.hz(),
            config.notch_q,
        )
        .map_err(|e| ViperError::Configuration(format!("notch filter: {e:?}")))?;

        let routing = if config.use_mapping {
            let matrix = RoutingMatrix::from_routes(
                config.output_channels,
                config.input_channels,
                &config.mapping,
            )
            .map_err(ViperError::Configuration)?;
            Some(matrix)
        } else {
            None
        };
        let data_channels = config.data_channels();

        Ok(Self {
            num_samples: config.num_samples,
            input_channels: config.input_channels,
            routing,
            filters: (0..data_channels)
                .map(|_| DirectForm2Transposed::<f64>::new(coefficients))
                .collect(),
        })
    }

    pub fn data_channels(&self) -> usize {
        self.filters.len()
    }

    pub fn frame_channels(&self) -> usize {
        self.data_channels() + STATUS_CHANNELS
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.frame_channels() * self.num_samples * 2
    }

    fn header(&self, buf: &mut BytesMut) {
        let channels = self.frame_channels() as i32;
        let samples = self.num_samples as i32;
        buf.put_i32_le(0);
        buf.put_i32_le(channels * samples * 2);
        buf.put_i16_le(DATA_TYPE_U16);
        buf.put_i32_le(2);
        buf.put_i32_le(channels);
        buf.put_i32_le(samples);
    }

    /// All-zero frame, used for idle bursts and underruns before the first real frame.
    pub fn zero_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.header(&mut buf);
        buf.put_bytes(0, self.frame_len() - HEADER_LEN);
        buf.freeze()
    }

    /// Encode one full batch of packets.
    ///
    /// The batch is expected to hold exactly `num_samples` packets; extra packets are
    /// ignored and missing ones are padded with zeros.
    pub fn encode(&mut self, packets: &[Packet]) -> Bytes {
        let data_channels = self.data_channels();
        let mut columns = vec![vec![0u16; self.num_samples]; self.frame_channels()];

        let mut physical = Vec::with_capacity(self.input_channels);
        let mut routed = Vec::with_capacity(data_channels);
        for (sample, packet) in packets.iter().take(self.num_samples).enumerate() {
            physical.clear();
            physical.extend(
                (0..self.input_channels)
                    .map(|c| packet.data.get(c).copied().map_or(0.0, f64::from)),
            );
            match &self.routing {
                Some(matrix) => matrix.apply(&physical, &mut routed),
                None => {
                    routed.clear();
                    routed.extend_from_slice(&physical);
                }
            }

            for (channel, filter) in self.filters.iter_mut().enumerate() {
                let value = routed.get(channel).copied().unwrap_or(0.0);
                columns[channel][sample] = clamp_sample(filter.run(value));
            }
            for bit in 0..STATUS_CHANNELS {
                let set = packet.status & (1 << (bit + 1)) != 0;
                columns[data_channels + bit][sample] = if set { u16::MAX } else { 0 };
            }
        }

        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.header(&mut buf);
        for column in &columns {
            for value in column {
                buf.put_u16_le(*value);
            }
        }
        buf.freeze()
    }
}
