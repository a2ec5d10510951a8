//! PKCS#7/CMS certs-only encoding.
//!
//! EST returns certificates inside a degenerate CMS SignedData: no
//! encapsulated content and no signer infos, only the `certificates` set
//! (RFC 7030 Section 4.1.3, RFC 5652 Section 5). This module builds that
//! structure for /cacerts and the enrollment endpoints, and parses it back.

use base64::prelude::*;
use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::{Decode, Encode};
use x509_cert::Certificate;

use super::TransferEncoding;
use crate::error::{EstError, Result};

/// Line length used for base64 response bodies.
pub const BASE64_LINE_LENGTH: usize = 64;

/// OID for SignedData: 1.2.840.113549.1.7.2
const SIGNED_DATA_OID: &str = "1.2.840.113549.1.7.2";

/// Encode certificates as a certs-only SignedData in the given transfer encoding.
///
/// Duplicate certificates are dropped: a DER `SET OF` cannot hold equal
/// elements, and an anchor bundle that repeats the CA cert is common.
pub fn encode_certs_only(certs: &[Certificate], encoding: TransferEncoding) -> Result<Vec<u8>> {
    let mut unique: Vec<Certificate> = Vec::with_capacity(certs.len());
    for cert in certs {
        if !unique.contains(cert) {
            unique.push(cert.clone());
        }
    }

    let content_info = ContentInfo::try_from(unique)?;
    let der_bytes = content_info.to_der()?;

    Ok(match encoding {
        TransferEncoding::Binary => der_bytes,
        TransferEncoding::Base64 => encode_base64_wrapped(&der_bytes, BASE64_LINE_LENGTH).into_bytes(),
    })
}

/// Parse a certs-only SignedData body in the given transfer encoding.
///
/// Certificates come back in DER `SET OF` order, which is canonical rather
/// than insertion order.
pub fn decode_certs_only(body: &[u8], encoding: TransferEncoding) -> Result<Vec<Certificate>> {
    let der_bytes = match encoding {
        TransferEncoding::Base64 => decode_base64(body)?,
        TransferEncoding::Binary => body.to_vec(),
    };

    let content_info = ContentInfo::from_der(&der_bytes)
        .map_err(|e| EstError::certificate(format!("Failed to parse ContentInfo: {}", e)))?;

    let signed_data = extract_signed_data(&content_info)?;

    extract_certificates(&signed_data)
}

/// Decode base64 data, ignoring line breaks and other whitespace.
pub(crate) fn decode_base64(data: &[u8]) -> Result<Vec<u8>> {
    let cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    BASE64_STANDARD.decode(&cleaned).map_err(EstError::Base64)
}

fn extract_signed_data(content_info: &ContentInfo) -> Result<SignedData> {
    let oid_str = content_info.content_type.to_string();
    if oid_str != SIGNED_DATA_OID {
        return Err(EstError::certificate(format!(
            "Expected SignedData OID, got {}",
            oid_str
        )));
    }

    let content = content_info.content.to_der()?;

    SignedData::from_der(&content)
        .map_err(|e| EstError::certificate(format!("Failed to parse SignedData: {}", e)))
}

fn extract_certificates(signed_data: &SignedData) -> Result<Vec<Certificate>> {
    let cert_set = match &signed_data.certificates {
        Some(certs) => certs,
        None => return Ok(Vec::new()),
    };

    let mut certificates = Vec::new();

    for cert_choice in cert_set.0.iter() {
        let cert_der = cert_choice.to_der()?;

        match Certificate::from_der(&cert_der) {
            Ok(cert) => certificates.push(cert),
            Err(e) => {
                tracing::warn!("Skipping non-X.509 certificate: {}", e);
            }
        }
    }

    Ok(certificates)
}

/// Encode DER data to base64 with CRLF line wrapping.
pub fn encode_base64_wrapped(data: &[u8], line_length: usize) -> String {
    let encoded = BASE64_STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / line_length.max(1) * 2);

    // base64 output is ASCII, so byte offsets are char boundaries
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let take = rest.len().min(line_length.max(1));
        let (line, tail) = rest.split_at(take);
        out.push_str(line);
        out.push_str("\r\n");
        rest = tail;
    }
    out
}
