//! Password-based file encryption and content checksums
//!
//! Container layout: `salt[16] || iv[16] || AES-256-CBC(PKCS#7(plaintext))`.
//! The key is PBKDF2-HMAC-SHA256 over the password and salt.
//!
//! CBC carries no authentication tag. A wrong password is usually caught by
//! the padding check, but tampering is only detected by the SHA-256 checksum
//! the transfer protocol carries, never by the cipher itself.

use crate::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN;
pub const KEY_LEN: usize = 32;
pub const PBKDF2_ROUNDS: u32 = 100_000;

const BLOCK_LEN: usize = 16;
const CIPHER_READ_SIZE: usize = 8 * 1024;
const CHECKSUM_READ_SIZE: usize = 4 * 1024;

/// Derive a 32-byte AES key from a password and salt
pub fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt everything from `input` into `output` as a container
pub fn encrypt<R: Read, W: Write>(mut input: R, mut output: W, password: &str) -> Result<()> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| Error::Crypto(format!("salt: {}", e)))?;
    getrandom::getrandom(&mut iv).map_err(|e| Error::Crypto(format!("iv: {}", e)))?;

    output.write_all(&salt)?;
    output.write_all(&iv)?;

    let key = derive_key(password, &salt);
    let mut cipher = Aes256CbcEnc::new(&key.into(), &iv.into());

    let mut buffer = vec![0u8; CIPHER_READ_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(CIPHER_READ_SIZE + BLOCK_LEN);

    loop {
        let n = read_some(&mut input, &mut buffer)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buffer[..n]);

        // Whole blocks can go out now; the tail waits for more input or padding
        let ready = pending.len() - pending.len() % BLOCK_LEN;
        for block in pending[..ready].chunks_exact_mut(BLOCK_LEN) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output.write_all(&pending[..ready])?;
        pending.drain(..ready);
    }

    let last = cipher.encrypt_padded_vec_mut::<Pkcs7>(&pending);
    output.write_all(&last)?;
    output.flush()?;
    Ok(())
}

/// Decrypt a container from `input` into `output`
pub fn decrypt<R: Read, W: Write>(mut input: R, mut output: W, password: &str) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    input.read_exact(&mut header).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            Error::Crypto(format!("container shorter than {}-byte header", HEADER_LEN))
        }
        _ => Error::Io(e),
    })?;
    let (salt, iv) = header.split_at(SALT_LEN);

    let key = derive_key(password, salt);
    let mut cipher = Aes256CbcDec::new(&key.into(), GenericArray::from_slice(iv));

    let mut buffer = vec![0u8; CIPHER_READ_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(CIPHER_READ_SIZE + BLOCK_LEN);

    loop {
        let n = read_some(&mut input, &mut buffer)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buffer[..n]);

        // Hold back the final whole block: it carries the padding
        let whole = pending.len() - pending.len() % BLOCK_LEN;
        let ready = if whole == pending.len() {
            whole.saturating_sub(BLOCK_LEN)
        } else {
            whole
        };
        for block in pending[..ready].chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output.write_all(&pending[..ready])?;
        pending.drain(..ready);
    }

    if pending.len() != BLOCK_LEN {
        return Err(Error::Crypto(
            "ciphertext is not a whole number of blocks".to_string(),
        ));
    }

    let last = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&pending)
        .map_err(|_| Error::Crypto("bad padding (wrong password or corrupt file)".to_string()))?;
    output.write_all(&last)?;
    output.flush()?;
    Ok(())
}

/// Streaming SHA-256 over the whole file, hex-encoded
pub fn checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHECKSUM_READ_SIZE];

    loop {
        let n = read_some(&mut file, &mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Encrypt `input_path` into `output_path`.
///
/// Output is staged in `<output>.tmp` and renamed into place on success, so a
/// failed run never leaves a partial container behind.
pub fn encrypt_file(input_path: &Path, output_path: &Path, password: &str) -> Result<()> {
    let input = File::open(input_path)?;
    write_atomically(output_path, |out| encrypt(input, out, password))?;
    tracing::debug!("Encrypted {} -> {}", input_path.display(), output_path.display());
    Ok(())
}

/// Decrypt `input_path` into `output_path`, with the same staging as [`encrypt_file`]
pub fn decrypt_file(input_path: &Path, output_path: &Path, password: &str) -> Result<()> {
    let input = File::open(input_path)?;
    write_atomically(output_path, |out| decrypt(input, out, password))?;
    tracing::debug!("Decrypted {} -> {}", input_path.display(), output_path.display());
    Ok(())
}

fn write_atomically(
    output_path: &Path,
    body: impl FnOnce(std::io::BufWriter<&mut File>) -> Result<()>,
) -> Result<()> {
    let tmp_path = tmp_path_for(output_path);
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp_path)?;
        body(std::io::BufWriter::new(&mut file))?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, output_path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
