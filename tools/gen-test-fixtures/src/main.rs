use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use oidc_sso::{FileKeyStore, KeyMaterialStore, KeyRing, ProtectionKey};
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::json;
use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const JWKS_KID: &str = "test-key";
const KEY_LIFETIME_SECS: u64 = 90 * 86_400;

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::from_env(env::args().skip(1))?;
    generate_fixtures(&args.output, &args.application)
}

#[derive(Debug)]
struct Args {
    output: PathBuf,
    application: String,
}

impl Args {
    fn from_env(mut args: impl Iterator<Item = String>) -> Result<Self, Box<dyn Error>> {
        let mut output = PathBuf::from("fixtures");
        let mut application = String::from("oidc-sso");

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--output" => {
                    output = PathBuf::from(args.next().ok_or("--output requires a path argument")?)
                }
                "--application" => {
                    application = args.next().ok_or("--application requires a value")?;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {
                    return Err(format!("unexpected argument: {arg}\nUse --help for usage.").into());
                }
            }
        }

        Ok(Self {
            output,
            application,
        })
    }
}

fn print_help() {
    eprintln!(
        "Usage: cargo run -p gen-test-fixtures -- [--output DIR] [--application NAME]"
    );
}

fn generate_fixtures(output_dir: &Path, application: &str) -> Result<(), Box<dyn Error>> {
    write_signing_keys(&output_dir.join("test-keys"))?;
    write_key_ring(&output_dir.join("key-ring"), application)?;
    Ok(())
}

/// Provider-side signing material: a good key published in the JWKS and a
/// wrong key for signature failure tests.
fn write_signing_keys(key_dir: &Path) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(key_dir)?;

    let mut rng = OsRng;
    let good_private = RsaPrivateKey::new(&mut rng, 2048)?;
    let good_public = RsaPublicKey::from(&good_private);
    let wrong_private = RsaPrivateKey::new(&mut rng, 2048)?;

    let good_private_pem = good_private.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let good_public_pem = good_public.to_public_key_pem(LineEnding::LF)?;
    let wrong_private_pem = wrong_private.to_pkcs8_pem(LineEnding::LF)?.to_string();

    fs::write(key_dir.join("rsa-private.pem"), &good_private_pem)?;
    fs::write(key_dir.join("rsa-public.pem"), &good_public_pem)?;
    fs::write(key_dir.join("wrong-key-private.pem"), &wrong_private_pem)?;

    let n = URL_SAFE_NO_PAD.encode(good_public.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(good_public.e().to_bytes_be());
    let jwks = json!({
        "keys": [
            {
                "kty": "RSA",
                "kid": JWKS_KID,
                "use": "sig",
                "alg": "RS256",
                "n": n,
                "e": e,
            }
        ]
    });
    fs::write(key_dir.join("jwks.json"), serde_json::to_vec_pretty(&jwks)?)?;
    Ok(())
}

/// A seeded cookie key ring in the on-disk layout the file store reads: one
/// current key and a successor that activates a day later.
fn write_key_ring(root: &Path, application: &str) -> Result<(), Box<dyn Error>> {
    let store = FileKeyStore::new(root, application)?;
    let now = now_secs();

    let current = ProtectionKey::generate(now, now, KEY_LIFETIME_SECS);
    let successor = ProtectionKey::generate(now, now + 86_400, KEY_LIFETIME_SECS);
    store.save(&KeyRing::from_keys([current, successor]))?;

    let ring = store.load()?;
    eprintln!(
        "wrote {} keys to {} (current: {})",
        ring.len(),
        store.dir().display(),
        ring.current(now).map(|k| k.id.as_str()).unwrap_or("none")
    );
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}
