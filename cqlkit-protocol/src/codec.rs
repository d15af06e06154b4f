//! Body codecs. The driver frames envelopes itself and hands bodies to a [`MessageCodec`], so
//! the byte layout of messages can be swapped without touching connection handling.
use std::fmt::Debug;

use crate::error::{Error, Result};
use crate::frame::message_request::RequestBody;
use crate::frame::message_response::ResponseBody;
use crate::frame::{Opcode, Version};

/// Encodes and decodes message bodies for a given protocol version.
pub trait MessageCodec: Send + Sync + Debug {
    fn encode_request(&self, body: &RequestBody, version: Version) -> Result<Vec<u8>>;

    fn decode_request(&self, opcode: Opcode, body: &[u8], version: Version)
        -> Result<RequestBody>;

    fn encode_response(&self, body: &ResponseBody, version: Version) -> Result<Vec<u8>>;

    fn decode_response(
        &self,
        opcode: Opcode,
        body: &[u8],
        version: Version,
    ) -> Result<ResponseBody>;
}

/// Codec representing bodies as JSON documents. Every version uses the same layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

fn check_opcode(expected: Opcode, actual: Opcode) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::Codec(format!(
            "Body of {actual} doesn't match envelope opcode {expected}"
        )))
    }
}

impl MessageCodec for JsonCodec {
    fn encode_request(&self, body: &RequestBody, _version: Version) -> Result<Vec<u8>> {
        serde_json::to_vec(body).map_err(Into::into)
    }

    fn decode_request(
        &self,
        opcode: Opcode,
        body: &[u8],
        _version: Version,
    ) -> Result<RequestBody> {
        let request: RequestBody = serde_json::from_slice(body)?;
        check_opcode(opcode, request.opcode())?;
        Ok(request)
    }

    fn encode_response(&self, body: &ResponseBody, _version: Version) -> Result<Vec<u8>> {
        serde_json::to_vec(body).map_err(Into::into)
    }

    fn decode_response(
        &self,
        opcode: Opcode,
        body: &[u8],
        _version: Version,
    ) -> Result<ResponseBody> {
        let response: ResponseBody = serde_json::from_slice(body)?;
        check_opcode(opcode, response.opcode())?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::Consistency;
    use crate::frame::message_error::{AdditionalErrorInfo, ErrorBody, ReadTimeoutError};
    use crate::query::QueryParams;

    #[test]
    fn should_decode_encoded_error() {
        let codec = JsonCodec;
        let response = ResponseBody::Error(ErrorBody::new(
            "timeout",
            AdditionalErrorInfo::ReadTimeout(ReadTimeoutError {
                cl: Consistency::Quorum,
                received: 1,
                block_for: 2,
                data_present: false,
            }),
        ));

        let bytes = codec.encode_response(&response, Version::V4).unwrap();
        let decoded = codec
            .decode_response(Opcode::Error, &bytes, Version::V4)
            .unwrap();

        assert_eq!(decoded, response);
    }

    #[test]
    fn should_reject_opcode_mismatch() {
        let codec = JsonCodec;
        let request = RequestBody::new_query("SELECT now() FROM system.local", QueryParams::default());
        let bytes = codec.encode_request(&request, Version::V4).unwrap();

        assert!(matches!(
            codec.decode_request(Opcode::Prepare, &bytes, Version::V4),
            Err(Error::Codec(_))
        ));
    }
}
