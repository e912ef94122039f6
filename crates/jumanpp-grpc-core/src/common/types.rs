//! # Per-call configuration header
//!
//! Clients override the service's default analyzer configuration by attaching
//! a serialized [`JumanppConfig`] to the call metadata under
//! [`CONFIG_HEADER`]. The server merges it over its defaults with protobuf
//! merge semantics: only fields present on the wire are overridden.
//!
//! A header that fails to decode or carries out-of-range values is rejected
//! with [`Error::InvalidArgument`] before any analyzer is acquired.

use crate::{
    Error, Result,
    proto::{JumanppConfig, RequestType},
};
use prost::Message;

/// Binary metadata key carrying a serialized [`JumanppConfig`] override.
pub const CONFIG_HEADER: &str = "jumanpp-config-bin";

impl JumanppConfig {
    /// Merges a serialized override into `self`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `bytes` is not a valid encoding.
    pub fn merge_header(&mut self, bytes: &[u8]) -> Result<()> {
        self.merge(bytes)
            .map_err(|_| Error::invalid_argument("invalid config header"))
    }

    /// Checks that the configuration can be used to build an analyzer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the local beam is not positive or
    /// any width is negative.
    pub fn validate(&self) -> Result<()> {
        if self.local_beam < 1 {
            return Err(Error::invalid_argument(format!(
                "local_beam must be at least 1 (got {})",
                self.local_beam
            )));
        }
        if self.global_beam_left < 0 || self.global_beam_right < 0 {
            return Err(Error::invalid_argument(format!(
                "global beam widths must not be negative (got {}/{})",
                self.global_beam_left, self.global_beam_right
            )));
        }
        if self.top_n < 0 {
            return Err(Error::invalid_argument(format!(
                "top_n must not be negative (got {})",
                self.top_n
            )));
        }
        Ok(())
    }

    /// Serializes the configuration for use as a [`CONFIG_HEADER`] value.
    pub fn to_header(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

impl RequestType {
    /// Resolves a raw wire value, rejecting kinds this server cannot read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotImplemented`] for unknown values.
    pub fn from_wire(value: i32) -> Result<Self> {
        Self::try_from(value).map_err(|_| Error::NotImplemented {
            what: format!("request type {value}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> JumanppConfig {
        JumanppConfig {
            local_beam: 5,
            global_beam_left: 6,
            global_beam_right: 1,
            global_beam_check: true,
            ignore_rnn: false,
            top_n: 0,
        }
    }

    #[test]
    fn header_overrides_only_present_fields() {
        // proto3 scalars equal to their default are not encoded, so only the
        // local beam and ignore flag travel on the wire here.
        let header = JumanppConfig {
            local_beam: 3,
            ignore_rnn: true,
            ..Default::default()
        }
        .to_header();

        let mut cfg = defaults();
        cfg.merge_header(&header).unwrap();

        assert_eq!(cfg.local_beam, 3);
        assert!(cfg.ignore_rnn);
        assert_eq!(cfg.global_beam_left, 6);
        assert_eq!(cfg.global_beam_right, 1);
        assert!(cfg.global_beam_check);
    }

    #[test]
    fn malformed_header_is_invalid_argument() {
        let mut cfg = defaults();
        let err = cfg.merge_header(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        assert!(defaults().validate().is_ok());

        let zero_beam = JumanppConfig {
            local_beam: 0,
            ..defaults()
        };
        assert!(matches!(
            zero_beam.validate(),
            Err(Error::InvalidArgument { .. })
        ));

        let negative_gbeam = JumanppConfig {
            global_beam_right: -1,
            ..defaults()
        };
        assert!(negative_gbeam.validate().is_err());

        let negative_top = JumanppConfig {
            top_n: -2,
            ..defaults()
        };
        assert!(negative_top.validate().is_err());
    }

    #[test]
    fn unknown_request_type_is_not_implemented() {
        assert_eq!(RequestType::from_wire(0).unwrap(), RequestType::Normal);
        assert_eq!(
            RequestType::from_wire(1).unwrap(),
            RequestType::PartialAnnotation
        );
        assert!(matches!(
            RequestType::from_wire(7),
            Err(Error::NotImplemented { .. })
        ));
    }
}
