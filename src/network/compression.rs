use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// Bodies smaller than this are sent as-is.
pub const MIN_COMPRESS_LEN: usize = 1024;

/// Compress data using gzip
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Whether a body of `len` bytes should be gzipped for a client sending
/// `accept_encoding`.
pub fn should_compress(accept_encoding: Option<&str>, len: usize) -> bool {
    len >= MIN_COMPRESS_LEN
        && accept_encoding.is_some_and(|value| {
            value
                .split(',')
                .any(|coding| coding.split(';').next().map(str::trim) == Some("gzip"))
        })
}

#[cfg(target_os = "espidf")]
pub use device::write_api_response;

#[cfg(target_os = "espidf")]
mod device {
    use super::{gzip_compress, should_compress};
    use esp_idf_svc::http::server::{EspHttpConnection, Request};
    use esp_idf_svc::io::Write;
    use ota_core::ApiResponse;

    /// Send `response`, gzipped when the client accepts it and the body is
    /// large enough to be worth it.
    pub fn write_api_response(
        req: Request<&mut EspHttpConnection<'_>>,
        response: &ApiResponse,
    ) -> anyhow::Result<()> {
        let body = response.body.as_bytes();
        let status = response.status_code;
        let reason = Some(response.reason());

        if should_compress(req.header("Accept-Encoding"), body.len()) {
            match gzip_compress(body) {
                Ok(compressed) => {
                    log::debug!("Compressed {} bytes to {} bytes", body.len(), compressed.len());
                    let mut out = req.into_response(
                        status,
                        reason,
                        &[
                            ("Content-Type", response.content_type),
                            ("Content-Encoding", "gzip"),
                            ("Vary", "Accept-Encoding"),
                        ],
                    )?;
                    out.write_all(&compressed)?;
                    return Ok(());
                }
                Err(e) => log::warn!("Compression failed: {}", e),
            }
        }

        let mut out = req.into_response(status, reason, &[("Content-Type", response.content_type)])?;
        out.write_all(body)?;
        Ok(())
    }
}
