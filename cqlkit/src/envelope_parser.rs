use tokio::io::AsyncReadExt;

use cqlkit_protocol::error;
use cqlkit_protocol::frame::{Envelope, EnvelopeHeader, HEADER_LEN};

/// Reads a single envelope: fixed header first, then exactly as many body bytes as announced.
pub async fn parse_envelope<T: AsyncReadExt + Unpin>(reader: &mut T) -> error::Result<Envelope> {
    let mut header_bytes = [0; HEADER_LEN];
    reader.read_exact(&mut header_bytes).await?;

    let header = EnvelopeHeader::parse(&header_bytes)?;

    let mut body = vec![0; header.body_len];
    reader.read_exact(&mut body).await?;

    Ok(Envelope::from_parts(header, body))
}
