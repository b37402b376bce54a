//! AES in CBC, CFB and OFB modes.
//!
//! CBC pads with PKCS#7. CFB and OFB are stream modes and keep the length.

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{
    AsyncStreamCipher, BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher,
};

use super::{CipherKind, CryptoError, CIPHER_BLOCK_SIZE};
use crate::buffer::Buf;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128CfbEnc = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;
type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;
type Aes128Ofb = ofb::Ofb<aes::Aes128>;
type Aes256Ofb = ofb::Ofb<aes::Aes256>;

fn key_err<E>(_: E) -> CryptoError {
    CryptoError::InvalidKeyLength
}

/// Encrypt `input` and append the ciphertext to `out`.
pub(crate) fn encrypt(
    kind: CipherKind,
    key: &[u8],
    iv: &[u8],
    input: &[u8],
    out: &mut Buf,
) -> Result<(), CryptoError> {
    let key = &key[..kind.key_len().min(key.len())];
    match kind {
        CipherKind::None => out.extend_from_slice(input),
        CipherKind::Aes128Cbc => {
            let c = Aes128CbcEnc::new_from_slices(key, iv).map_err(key_err)?;
            out.extend_from_slice(&c.encrypt_padded_vec_mut::<Pkcs7>(input));
        }
        CipherKind::Aes256Cbc => {
            let c = Aes256CbcEnc::new_from_slices(key, iv).map_err(key_err)?;
            out.extend_from_slice(&c.encrypt_padded_vec_mut::<Pkcs7>(input));
        }
        CipherKind::Aes128Cfb => {
            let c = Aes128CfbEnc::new_from_slices(key, iv).map_err(key_err)?;
            let start = out.len();
            out.extend_from_slice(input);
            c.encrypt(&mut out[start..]);
        }
        CipherKind::Aes256Cfb => {
            let c = Aes256CfbEnc::new_from_slices(key, iv).map_err(key_err)?;
            let start = out.len();
            out.extend_from_slice(input);
            c.encrypt(&mut out[start..]);
        }
        CipherKind::Aes128Ofb => {
            let mut c = Aes128Ofb::new_from_slices(key, iv).map_err(key_err)?;
            let start = out.len();
            out.extend_from_slice(input);
            c.apply_keystream(&mut out[start..]);
        }
        CipherKind::Aes256Ofb => {
            let mut c = Aes256Ofb::new_from_slices(key, iv).map_err(key_err)?;
            let start = out.len();
            out.extend_from_slice(input);
            c.apply_keystream(&mut out[start..]);
        }
    }
    Ok(())
}

/// Decrypt `input` and append the plaintext to `out`.
pub(crate) fn decrypt(
    kind: CipherKind,
    key: &[u8],
    iv: &[u8],
    input: &[u8],
    out: &mut Buf,
) -> Result<(), CryptoError> {
    let key = &key[..kind.key_len().min(key.len())];
    match kind {
        CipherKind::None => out.extend_from_slice(input),
        CipherKind::Aes128Cbc | CipherKind::Aes256Cbc => {
            if input.is_empty() || input.len() % CIPHER_BLOCK_SIZE != 0 {
                return Err(CryptoError::DecryptFailed);
            }
            let plain = if kind == CipherKind::Aes128Cbc {
                Aes128CbcDec::new_from_slices(key, iv)
                    .map_err(key_err)?
                    .decrypt_padded_vec_mut::<Pkcs7>(input)
            } else {
                Aes256CbcDec::new_from_slices(key, iv)
                    .map_err(key_err)?
                    .decrypt_padded_vec_mut::<Pkcs7>(input)
            };
            let plain = plain.map_err(|_| CryptoError::DecryptFailed)?;
            out.extend_from_slice(&plain);
        }
        CipherKind::Aes128Cfb => {
            let c = Aes128CfbDec::new_from_slices(key, iv).map_err(key_err)?;
            let start = out.len();
            out.extend_from_slice(input);
            c.decrypt(&mut out[start..]);
        }
        CipherKind::Aes256Cfb => {
            let c = Aes256CfbDec::new_from_slices(key, iv).map_err(key_err)?;
            let start = out.len();
            out.extend_from_slice(input);
            c.decrypt(&mut out[start..]);
        }
        // OFB is symmetric.
        CipherKind::Aes128Ofb | CipherKind::Aes256Ofb => {
            encrypt(kind, key, iv, input, out)?;
        }
    }
    Ok(())
}
