//! Signal decoding for the Roadcast edge agent
//!
//! Decoder dictionaries are the projection of the active decoder manifest
//! through the enabled collection schemes; the CAN and OBD decoders consume
//! them on the ingest paths.

pub mod can;
pub mod dictionary;
pub mod obd;
pub mod translator;

pub use can::{CanDecoder, DecodeError};
pub use dictionary::{
    CanDecoderDictionary, CanMessageDecoderMethod, ComplexDataMessageFormat,
    ComplexDecoderDictionary, CustomDecoderDictionary, DecoderDictionary, DecoderDictionaryMap,
};
pub use obd::{ObdDataDecoder, ObdDecodeError};
pub use translator::CanInterfaceIdTranslator;
