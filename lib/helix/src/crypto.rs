use ctor::ctor;
use libsodium_sys;

pub const PUBLIC_KEY_SIZE: usize = libsodium_sys::crypto_box_PUBLICKEYBYTES as usize;
pub const SECRET_KEY_SIZE: usize = libsodium_sys::crypto_box_SECRETKEYBYTES as usize;
pub const SESSION_KEY_SIZE: usize = libsodium_sys::crypto_box_BEFORENMBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_box_NONCEBYTES as usize;
pub const MAC_SIZE: usize = libsodium_sys::crypto_box_MACBYTES as usize;

/// Zero prefix required on plaintext buffers by the classic NaCl box API.
pub const PLAIN_PAD: usize = libsodium_sys::crypto_box_ZEROBYTES as usize;
/// Zero prefix carried on ciphertext buffers by the classic NaCl box API.
pub const BOX_PAD: usize = libsodium_sys::crypto_box_BOXZEROBYTES as usize;

/// Initialize the sodium infrastructure
#[ctor(unsafe)]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Generates a fresh Curve25519 keypair.
#[inline]
pub fn keypair() -> ([u8; PUBLIC_KEY_SIZE], [u8; SECRET_KEY_SIZE]) {
    let mut public = [0u8; PUBLIC_KEY_SIZE];
    let mut secret = [0u8; SECRET_KEY_SIZE];

    unsafe {
        libsodium_sys::crypto_box_keypair(public.as_mut_ptr(), secret.as_mut_ptr());
    }

    (public, secret)
}

/// Derives the public key matching the supplied secret key.
#[inline]
pub fn scalarmult_base(secret: &[u8; SECRET_KEY_SIZE]) -> [u8; PUBLIC_KEY_SIZE] {
    let mut public = [0u8; PUBLIC_KEY_SIZE];

    unsafe {
        libsodium_sys::crypto_scalarmult_base(public.as_mut_ptr(), secret.as_ptr());
    }

    public
}

/// Precomputes the shared session key for the supplied peer public key and local secret key,
/// enabling the symmetric-speed `seal_afternm`/`open_afternm` operations.
#[inline]
pub fn beforenm(
    session: &mut [u8; SESSION_KEY_SIZE],
    public: &[u8; PUBLIC_KEY_SIZE],
    secret: &[u8; SECRET_KEY_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_box_beforenm(session.as_mut_ptr(), public.as_ptr(), secret.as_ptr()) == 0
    }
}

/// Seals `plain` into `cipher` under the recipient public key and sender secret key.
///
/// Both buffers use the classic NaCl convention: `plain` must start with `PLAIN_PAD` zero
/// bytes and `cipher` comes back with `BOX_PAD` leading zero bytes followed by the MAC and
/// the encrypted data. The function panics if the buffer lengths do not match.
#[inline]
pub fn seal(
    cipher: &mut [u8],
    plain: &[u8],
    nonce: &[u8; NONCE_SIZE],
    public: &[u8; PUBLIC_KEY_SIZE],
    secret: &[u8; SECRET_KEY_SIZE],
) -> bool {
    check_box_buffers(cipher.len(), plain.len());

    unsafe {
        libsodium_sys::crypto_box(
            cipher.as_mut_ptr(),
            plain.as_ptr(),
            plain.len() as u64,
            nonce.as_ptr(),
            public.as_ptr(),
            secret.as_ptr(),
        ) == 0
    }
}

/// Opens `cipher` into `plain` under the sender public key and recipient secret key.
/// Buffer conventions are the same as for `seal`.
#[inline]
pub fn open(
    plain: &mut [u8],
    cipher: &[u8],
    nonce: &[u8; NONCE_SIZE],
    public: &[u8; PUBLIC_KEY_SIZE],
    secret: &[u8; SECRET_KEY_SIZE],
) -> bool {
    check_box_buffers(cipher.len(), plain.len());

    unsafe {
        libsodium_sys::crypto_box_open(
            plain.as_mut_ptr(),
            cipher.as_ptr(),
            cipher.len() as u64,
            nonce.as_ptr(),
            public.as_ptr(),
            secret.as_ptr(),
        ) == 0
    }
}

/// Seals `plain` into `cipher` with a precomputed session key.
#[inline]
pub fn seal_afternm(
    cipher: &mut [u8],
    plain: &[u8],
    nonce: &[u8; NONCE_SIZE],
    session: &[u8; SESSION_KEY_SIZE],
) -> bool {
    check_box_buffers(cipher.len(), plain.len());

    unsafe {
        libsodium_sys::crypto_box_afternm(
            cipher.as_mut_ptr(),
            plain.as_ptr(),
            plain.len() as u64,
            nonce.as_ptr(),
            session.as_ptr(),
        ) == 0
    }
}

/// Opens `cipher` into `plain` with a precomputed session key.
#[inline]
pub fn open_afternm(
    plain: &mut [u8],
    cipher: &[u8],
    nonce: &[u8; NONCE_SIZE],
    session: &[u8; SESSION_KEY_SIZE],
) -> bool {
    check_box_buffers(cipher.len(), plain.len());

    unsafe {
        libsodium_sys::crypto_box_open_afternm(
            plain.as_mut_ptr(),
            cipher.as_ptr(),
            cipher.len() as u64,
            nonce.as_ptr(),
            session.as_ptr(),
        ) == 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Overwrites the buffer with zeroes in a way the optimizer cannot elide.
#[inline]
pub fn memzero(out: &mut [u8]) {
    unsafe {
        libsodium_sys::sodium_memzero(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

#[inline]
fn check_box_buffers(cipher_len: usize, plain_len: usize) {
    if cipher_len != plain_len || plain_len < PLAIN_PAD {
        panic!(
            "Box buffers must have equal length and room for the padding, got cipher {} and plain {}",
            cipher_len, plain_len
        )
    }
}
