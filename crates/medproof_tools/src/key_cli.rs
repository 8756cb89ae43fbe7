#![forbid(unsafe_code)]

use std::fs;

use medproof_engines::crypto_vault::{
    decode_key, generate_key_b64, sha256_digest, CryptoVault,
};
use medproof_engines::ledger_client::{generate_operator_key_b64, OperatorSigner};
use medproof_kernel_contracts::common::from_hex;
use medproof_kernel_contracts::record::{AES_GCM_IV_LEN, AES_GCM_TAG_LEN};

pub const USAGE: &str = "usage: medproof <keygen vault|keygen operator|address|hash <file>|decrypt <in> <out> <iv_hex> <tag_hex>>";

/// Subcommands that read a secret (vault or operator key) before running.
pub fn secret_prompt_for(subcommand: &str) -> Option<&'static str> {
    match subcommand {
        "address" => Some("operator key (base64)"),
        "decrypt" => Some("vault key (base64)"),
        _ => None,
    }
}

pub fn execute_key_command(
    subcommand: &str,
    args: &[String],
    secret: Option<&str>,
) -> Result<String, String> {
    match subcommand {
        "keygen" => match args.first().map(String::as_str) {
            Some("vault") => Ok(generate_key_b64()),
            Some("operator") => {
                let encoded = generate_operator_key_b64();
                let signer = OperatorSigner::from_secret_b64(&encoded)
                    .map_err(|e| format!("failed to derive operator address: {e}"))?;
                Ok(format!("{encoded}\naddress {}", signer.address()))
            }
            _ => Err("usage: medproof keygen <vault|operator>".to_string()),
        },
        "address" => {
            let secret = secret.ok_or_else(|| "missing operator key input".to_string())?;
            let signer = OperatorSigner::from_secret_b64(secret)
                .map_err(|e| format!("invalid operator key: {e}"))?;
            Ok(signer.address().to_string())
        }
        "hash" => {
            let path = args
                .first()
                .ok_or_else(|| "usage: medproof hash <file>".to_string())?;
            let bytes = fs::read(path).map_err(|e| format!("failed to read {path}: {e}"))?;
            Ok(sha256_digest(&bytes).to_hex())
        }
        "decrypt" => {
            let [input, output, iv_hex, tag_hex] = args else {
                return Err("usage: medproof decrypt <in> <out> <iv_hex> <tag_hex>".to_string());
            };
            let secret = secret.ok_or_else(|| "missing vault key input".to_string())?;
            let key = decode_key(secret).map_err(|e| format!("invalid vault key: {e}"))?;
            let iv: [u8; AES_GCM_IV_LEN] = fixed_hex("iv", iv_hex)?;
            let tag: [u8; AES_GCM_TAG_LEN] = fixed_hex("tag", tag_hex)?;
            let ciphertext =
                fs::read(input).map_err(|e| format!("failed to read {input}: {e}"))?;
            let plaintext = CryptoVault::with_key(&key)
                .decrypt(&ciphertext, &iv, &tag)
                .map_err(|e| format!("decrypt failed: {e}"))?;
            fs::write(output, &plaintext).map_err(|e| format!("failed to write {output}: {e}"))?;
            Ok(format!("OK integrity_hash {}", sha256_digest(&plaintext).to_hex()))
        }
        _ => Err(format!(
            "unknown subcommand: {subcommand}. expected one of: keygen, address, hash, decrypt"
        )),
    }
}

fn fixed_hex<const N: usize>(field: &'static str, raw: &str) -> Result<[u8; N], String> {
    from_hex(field, raw.trim())
        .map_err(|e| e.to_string())?
        .try_into()
        .map_err(|_| format!("{field} must be {N} bytes"))
}
