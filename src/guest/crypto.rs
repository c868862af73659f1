//! Emulated `crypto` module, host side.
//!
//! The useful core only: hashing through the host's digest implementations,
//! random bytes, and UUIDs. Key material and ciphers stay out of the
//! sandbox.

use rand::RngCore;
use rquickjs::function::Func;
use rquickjs::{ArrayBuffer, Ctx, Object, Value};
use sha2::Digest;

use crate::sandbox::bridge::{throw_code, value_to_bytes};
use crate::sandbox::state::GuestCell;

use super::GuestModule;

/// Digest `data` with a named algorithm.
pub fn digest(algorithm: &str, data: &[u8]) -> Option<Vec<u8>> {
    match algorithm {
        "sha256" => Some(sha2::Sha256::digest(data).to_vec()),
        "sha512" => Some(sha2::Sha512::digest(data).to_vec()),
        "sha1" => Some(sha1::Sha1::digest(data).to_vec()),
        "md5" => Some(md5::compute(data).0.to_vec()),
        _ => None,
    }
}

/// Emulated `crypto` module.
pub struct CryptoModule;

impl GuestModule for CryptoModule {
    fn name(&self) -> &'static str {
        "crypto"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, _state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        ops.set(
            "hash",
            Func::from(
                |ctx: Ctx<'js>, algorithm: String, data: Value<'js>| -> rquickjs::Result<ArrayBuffer<'js>> {
                    let bytes = value_to_bytes(&ctx, &data)?;
                    let out = digest(&algorithm, &bytes).ok_or_else(|| {
                        throw_code(
                            &ctx,
                            "EINVAL",
                            &format!("unsupported digest algorithm '{}'", algorithm),
                        )
                    })?;
                    ArrayBuffer::new(ctx, out)
                },
            ),
        )?;

        ops.set(
            "randomBytes",
            Func::from(|ctx: Ctx<'js>, length: usize| -> rquickjs::Result<ArrayBuffer<'js>> {
                if length > 1024 * 1024 {
                    return Err(throw_code(&ctx, "EINVAL", "randomBytes length too large"));
                }
                let mut bytes = vec![0u8; length];
                rand::thread_rng().fill_bytes(&mut bytes);
                ArrayBuffer::new(ctx, bytes)
            }),
        )?;

        ops.set(
            "randomUUID",
            Func::from(|| -> String { uuid::Uuid::new_v4().to_string() }),
        )?;

        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_sha256() {
        let out = digest("sha256", b"hello world").unwrap();
        assert_eq!(
            out.iter().map(|b| format!("{:02x}", b)).collect::<String>(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_digest_unknown_algorithm() {
        assert!(digest("blake2b", b"x").is_none());
    }
}
