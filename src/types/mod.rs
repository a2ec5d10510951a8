// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! EST message types and encoding utilities.
//!
//! This module provides the PKCS#7 certs-only response encoder, the
//! transfer-encoding negotiation type, and protocol constants.

pub mod pkcs7;

pub use pkcs7::{decode_certs_only, encode_base64_wrapped, encode_certs_only};

use serde::{Deserialize, Serialize};

/// Content-Transfer-Encoding of an EST message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEncoding {
    /// Base64 text, as RFC 7030 Section 4.1.3 specifies.
    #[default]
    Base64,

    /// Raw DER bytes.
    #[serde(rename = "der", alias = "binary")]
    Binary,
}

impl TransferEncoding {
    /// Determine the request encoding from a `Content-Transfer-Encoding` header value.
    ///
    /// Any value other than `base64` (case-insensitive) means binary.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("base64") => Self::Base64,
            _ => Self::Binary,
        }
    }

    /// Header value to emit for a response in this encoding, if any.
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Self::Base64 => Some("base64"),
            Self::Binary => None,
        }
    }
}

impl std::fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base64 => write!(f, "base64"),
            Self::Binary => write!(f, "der"),
        }
    }
}

/// Content types used in EST protocol.
pub mod content_types {
    /// PKCS#10 CSR content type.
    pub const PKCS10: &str = "application/pkcs10";

    /// PKCS#7/CMS content type.
    pub const PKCS7_MIME: &str = "application/pkcs7-mime";

    /// PKCS#7 certs-only content type with smime-type parameter.
    pub const PKCS7_CERTS_ONLY: &str = "application/pkcs7-mime; smime-type=certs-only";

    /// JSON content type for the status API.
    pub const JSON: &str = "application/json";

    /// Plain text, used for bare error bodies.
    pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
}

/// EST operation paths.
pub mod operations {
    /// Well-known URI prefix.
    pub const WELL_KNOWN_PREFIX: &str = "/.well-known/est";

    /// CA certificates endpoint.
    pub const CACERTS: &str = "cacerts";

    /// Simple enrollment endpoint.
    pub const SIMPLE_ENROLL: &str = "simpleenroll";

    /// Simple re-enrollment endpoint.
    pub const SIMPLE_REENROLL: &str = "simplereenroll";

    /// Password-only bootstrap enrollment endpoint.
    pub const BOOTSTRAP: &str = "bootstrap";
}
