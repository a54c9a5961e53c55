//! Line encoding of kernel messages and their signatures.
//!
//! A line is one JSON object with the keys `signature`, `header`,
//! `parent_header`, `metadata` and `content`. The signature is the hex
//! HMAC-SHA256 of the four serialized parts, in that order, exactly as they
//! appear on the line, keyed with the connection key. An empty key turns
//! signing off.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::value::{RawValue, to_raw_value};
use sha2::Sha256;

use crate::kernel::config::{DEFAULT_SIGNATURE_SCHEME, KernelConfig};
use crate::kernel::error::{KernelError, Result};
use crate::kernel::message::Message;

type HmacSha256 = Hmac<Sha256>;

/// Signs outgoing lines and checks incoming ones
#[derive(Clone)]
pub struct Signer {
    mac: Option<HmacSha256>,
}

impl Signer {
    pub fn new(scheme: &str, key: &str) -> Result<Self> {
        if key.is_empty() {
            return Ok(Self { mac: None });
        }
        if scheme != DEFAULT_SIGNATURE_SCHEME {
            return Err(KernelError::config(format!(
                "unsupported signature scheme '{scheme}'"
            )));
        }
        let mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| KernelError::config(format!("invalid key: {e}")))?;
        Ok(Self { mac: Some(mac) })
    }

    pub fn from_config(config: &KernelConfig) -> Result<Self> {
        Self::new(&config.signature_scheme, &config.key)
    }

    pub fn is_enabled(&self) -> bool {
        self.mac.is_some()
    }

    fn digest(&self, parts: [&str; 4]) -> Option<HmacSha256> {
        let mut mac = self.mac.clone()?;
        for part in parts {
            mac.update(part.as_bytes());
        }
        Some(mac)
    }

    /// Hex signature of `parts`; empty when signing is off
    pub fn sign(&self, parts: [&str; 4]) -> String {
        self.digest(parts)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default()
    }

    /// Constant-time check of `signature` against `parts`
    pub fn verify(&self, parts: [&str; 4], signature: &str) -> bool {
        let Some(mac) = self.digest(parts) else {
            return true;
        };
        match hex::decode(signature) {
            Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[derive(Serialize)]
struct OutgoingLine<'a> {
    signature: String,
    header: &'a RawValue,
    parent_header: &'a RawValue,
    metadata: &'a RawValue,
    content: &'a RawValue,
}

#[derive(Deserialize)]
struct IncomingLine<'a> {
    #[serde(default)]
    signature: String,
    #[serde(borrow)]
    header: &'a RawValue,
    #[serde(borrow)]
    parent_header: &'a RawValue,
    #[serde(borrow)]
    metadata: &'a RawValue,
    #[serde(borrow)]
    content: &'a RawValue,
}

/// Serialize and sign `msg` as one line, without the trailing newline
pub fn encode(signer: &Signer, msg: &Message) -> Result<String> {
    let header = to_raw_value(&msg.header)?;
    let parent_header = to_raw_value(&msg.parent_header)?;
    let metadata = to_raw_value(&msg.metadata)?;
    let content = to_raw_value(&msg.content)?;

    let signature = signer.sign([
        header.get(),
        parent_header.get(),
        metadata.get(),
        content.get(),
    ]);
    let line = OutgoingLine {
        signature,
        header: &header,
        parent_header: &parent_header,
        metadata: &metadata,
        content: &content,
    };
    Ok(serde_json::to_string(&line)?)
}

/// Parse one line, rejecting it unless the signature matches
pub fn decode(signer: &Signer, line: &str) -> Result<Message> {
    let wire: IncomingLine<'_> = serde_json::from_str(line)?;
    let parts = [
        wire.header.get(),
        wire.parent_header.get(),
        wire.metadata.get(),
        wire.content.get(),
    ];
    if !signer.verify(parts, &wire.signature) {
        return Err(KernelError::InvalidSignature);
    }

    Ok(Message {
        header: serde_json::from_str(parts[0])?,
        parent_header: serde_json::from_str(parts[1])?,
        metadata: serde_json::from_str(parts[2])?,
        content: serde_json::from_str(parts[3])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::message::Header;
    use serde_json::{Value, json};

    fn signer(key: &str) -> Signer {
        Signer::new("hmac-sha256", key).unwrap()
    }

    fn request() -> Message {
        Message::new(
            Header::new("execute_request", "frontend", "user"),
            None,
            json!({ "code": "print('hi')" }),
        )
    }

    #[test]
    fn signed_line_decodes_with_the_same_key() {
        let key = signer("secret-key");
        let msg = request();
        let line = encode(&key, &msg).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(decode(&key, &line).unwrap(), msg);
    }

    #[test]
    fn signature_covers_the_concatenated_parts() {
        let key = signer("key");
        assert_eq!(
            key.sign(["The quick brown fox ", "jumps over ", "the lazy ", "dog"]),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn rejects_forged_missing_and_wrong_key_signatures() {
        let key = signer("secret-key");
        let line = encode(&key, &request()).unwrap();

        let mut forged: Value = serde_json::from_str(&line).unwrap();
        forged["signature"] = json!("not-an-hmac");
        assert!(matches!(
            decode(&key, &forged.to_string()),
            Err(KernelError::InvalidSignature)
        ));

        forged.as_object_mut().unwrap().remove("signature");
        assert!(matches!(
            decode(&key, &forged.to_string()),
            Err(KernelError::InvalidSignature)
        ));

        assert!(matches!(
            decode(&signer("other-key"), &line),
            Err(KernelError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_content_fails_verification() {
        let key = signer("secret-key");
        let line = encode(&key, &request()).unwrap();
        let tampered = line.replace("print('hi')", "print('pwned')");
        assert!(matches!(
            decode(&key, &tampered),
            Err(KernelError::InvalidSignature)
        ));
    }

    #[test]
    fn empty_key_disables_signing() {
        let off = signer("");
        assert!(!off.is_enabled());
        let line = encode(&off, &request()).unwrap();
        let wire: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(wire["signature"], "");
        decode(&off, &line).unwrap();
    }

    #[test]
    fn unknown_scheme_is_config_error() {
        let err = Signer::new("hmac-md5", "key").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }
}
