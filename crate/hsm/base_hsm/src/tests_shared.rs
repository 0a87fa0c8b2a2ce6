//! Shared HSM test suite used by vendor crates and by the in-process mock.
//! Each vendor crate provides a small config and delegates to these helpers.
#![allow(clippy::panic_in_result_fn)]
#![allow(clippy::missing_panics_doc)]

use std::thread;

use cosmian_block_cipher::{
    AES_BLOCK_SIZE, BlockCipher, CipherError, SoftwareAesCipher, test_helpers::Ff1,
};
use cosmian_logger::{debug, info, log_init};
use rand::{TryRngCore, rngs::OsRng};
use uuid::Uuid;

use crate::{
    HError, HResult, HsmAesCipher, HsmProvider, HsmSession, KeyObjectHandle, KeyPersistence,
    SlotSelector,
};

/// Per-HSM configuration for shared tests
#[derive(Debug)]
pub struct HsmTestConfig {
    pub lib_path: String,
    pub user_password: String,
    pub slot: SlotSelector,
    /// number of threads for the concurrent test
    pub threads: usize,
}

/// FIPS-197 Appendix B
const APPENDIX_B_KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];
const APPENDIX_B_PLAINTEXT: [u8; 16] = [
    0x32, 0x43, 0xf6, 0xa8, 0x88, 0x5a, 0x30, 0x8d, 0x31, 0x31, 0x98, 0xa2, 0xe0, 0x37, 0x07, 0x34,
];
const APPENDIX_B_CIPHERTEXT: [u8; 16] = [
    0x39, 0x25, 0x84, 0x1d, 0x02, 0xdc, 0x09, 0xfb, 0xdc, 0x11, 0x85, 0x97, 0x19, 0x6a, 0x0b, 0x32,
];

fn generate_random_data<const T: usize>() -> HResult<[u8; T]> {
    let mut bytes = [0_u8; T];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| HError::Default(format!("Error generating random data: {e}")))?;
    Ok(bytes)
}

fn random_identifier() -> Vec<u8> {
    Uuid::new_v4().to_string().into_bytes()
}

fn create_random_key<const T: usize>(
    session: &HsmSession,
) -> HResult<([u8; T], KeyObjectHandle)> {
    let key = generate_random_data::<T>()?;
    let handle = session.create_aes_key(&random_identifier(), &key, KeyPersistence::Session)?;
    Ok((key, handle))
}

/// Open a session on the configured token with the capabilities of `P`.
pub fn open_session<P: HsmProvider>(cfg: &HsmTestConfig) -> HResult<HsmSession> {
    log_init(None);
    info!("opening a session on {}", cfg.lib_path);
    HsmSession::open_with_capabilities(
        &cfg.lib_path,
        &cfg.user_password,
        cfg.slot,
        P::capabilities(),
    )
}

/// Two sessions on the same token: closing the first one must not log out
/// or finalize under the second.
pub fn sessions_close_in_opening_order<P: HsmProvider>(cfg: &HsmTestConfig) -> HResult<()> {
    let first = open_session::<P>(cfg)?;
    let second = open_session::<P>(cfg)?;
    let key = second.create_aes_key(
        &random_identifier(),
        &APPENDIX_B_KEY,
        KeyPersistence::Session,
    )?;
    let cipher = HsmAesCipher::new(&second, key)?;

    first.close()?;
    assert!(second.is_open());
    let mut ciphertext = [0_u8; AES_BLOCK_SIZE];
    cipher.encrypt(&mut ciphertext, &APPENDIX_B_PLAINTEXT)?;
    assert_eq!(ciphertext, APPENDIX_B_CIPHERTEXT);
    second.close()
}

pub fn get_info(session: &HsmSession) -> HResult<()> {
    let info = session.get_info()?;
    info!("Connected to the HSM: {info}");
    assert!(info.cryptoki_version.0 >= 2);
    assert!(!info.manufacturer_id.is_empty());
    Ok(())
}

pub fn known_answer(session: &HsmSession) -> HResult<()> {
    let key = session.create_aes_key(
        &random_identifier(),
        &APPENDIX_B_KEY,
        KeyPersistence::Session,
    )?;
    let cipher = HsmAesCipher::new(session, key)?;
    assert_eq!(cipher.block_size(), AES_BLOCK_SIZE);

    let mut ciphertext = [0_u8; AES_BLOCK_SIZE];
    cipher.encrypt(&mut ciphertext, &APPENDIX_B_PLAINTEXT)?;
    assert_eq!(ciphertext, APPENDIX_B_CIPHERTEXT);

    let mut plaintext = [0_u8; AES_BLOCK_SIZE];
    cipher.decrypt(&mut plaintext, &ciphertext)?;
    assert_eq!(plaintext, APPENDIX_B_PLAINTEXT);

    session.destroy_key(&key)
}

fn round_trip_with<const T: usize>(session: &HsmSession) -> HResult<()> {
    let (raw_key, key) = create_random_key::<T>(session)?;
    let hsm_cipher = HsmAesCipher::new(session, key)?;
    let software_cipher = SoftwareAesCipher::new(&raw_key)?;
    for _ in 0..8 {
        let block = generate_random_data::<AES_BLOCK_SIZE>()?;
        let mut hsm_ciphertext = [0_u8; AES_BLOCK_SIZE];
        hsm_cipher.encrypt(&mut hsm_ciphertext, &block)?;
        let mut software_ciphertext = [0_u8; AES_BLOCK_SIZE];
        software_cipher.encrypt(&mut software_ciphertext, &block)?;
        assert_eq!(hsm_ciphertext, software_ciphertext);

        let mut recovered = [0_u8; AES_BLOCK_SIZE];
        hsm_cipher.decrypt(&mut recovered, &hsm_ciphertext)?;
        assert_eq!(recovered, block);
    }
    debug!("AES-{} round trips match the software backend", T * 8);
    session.destroy_key(&key)
}

/// Both backends produce the same blocks for the same key.
pub fn cross_backend_round_trip(session: &HsmSession) -> HResult<()> {
    round_trip_with::<16>(session)?;
    round_trip_with::<24>(session)?;
    round_trip_with::<32>(session)
}

pub fn in_place_and_short_buffers(session: &HsmSession) -> HResult<()> {
    let key = session.create_aes_key(
        &random_identifier(),
        &APPENDIX_B_KEY,
        KeyPersistence::Session,
    )?;
    let cipher = HsmAesCipher::new(session, key)?;

    let mut buffer = [0_u8; 2 * AES_BLOCK_SIZE];
    buffer[..AES_BLOCK_SIZE].copy_from_slice(&APPENDIX_B_PLAINTEXT);
    cipher.encrypt_in_place(&mut buffer)?;
    assert_eq!(buffer[..AES_BLOCK_SIZE], APPENDIX_B_CIPHERTEXT);
    assert_eq!(buffer[AES_BLOCK_SIZE..], [0_u8; AES_BLOCK_SIZE]);
    cipher.decrypt_in_place(&mut buffer)?;
    assert_eq!(buffer[..AES_BLOCK_SIZE], APPENDIX_B_PLAINTEXT);

    let mut dst = [0_u8; AES_BLOCK_SIZE];
    let res = cipher.encrypt(&mut dst, &APPENDIX_B_PLAINTEXT[..15]);
    assert!(
        matches!(res, Err(CipherError::ShortBuffer { len: 15, .. })),
        "{res:?}"
    );
    let res = cipher.decrypt(&mut dst[..8], &APPENDIX_B_CIPHERTEXT);
    assert!(
        matches!(res, Err(CipherError::ShortBuffer { len: 8, .. })),
        "{res:?}"
    );

    session.destroy_key(&key)
}

/// NIST SP 800-38G FF1 sample 1 with the key held by the HSM
pub fn ff1_end_to_end(session: &HsmSession) -> HResult<()> {
    let key = session.create_aes_key(
        &random_identifier(),
        &APPENDIX_B_KEY,
        KeyPersistence::Session,
    )?;
    let cipher = HsmAesCipher::new(session, key)?;
    let ff1 = Ff1::new(&cipher, 10)?;
    let ciphertext = ff1.encrypt("0123456789", &[])?;
    assert_eq!(ciphertext, "2433477484");
    assert_eq!(ff1.decrypt(&ciphertext, &[])?, "0123456789");
    session.destroy_key(&key)
}

pub fn find_key(session: &HsmSession) -> HResult<()> {
    let identifier = random_identifier();
    let created = session.create_aes_key(
        &identifier,
        &generate_random_data::<32>()?,
        KeyPersistence::Session,
    )?;
    let found = session.find_key(&identifier)?;
    assert_eq!(found, created);
    // a key found by identifier is usable right away
    HsmAesCipher::new(session, found)?;

    let res = session.find_key(&random_identifier());
    assert!(matches!(res, Err(HError::KeyNotFound(_))), "{res:?}");

    let duplicate = session.create_aes_key(
        &identifier,
        &generate_random_data::<16>()?,
        KeyPersistence::Session,
    )?;
    let res = session.find_key(&identifier);
    assert!(
        matches!(res, Err(HError::AmbiguousKeyIdentifier { count: 2, .. })),
        "{res:?}"
    );

    session.destroy_key(&duplicate)?;
    session.destroy_key(&created)?;
    Ok(())
}

pub fn destroy_key(session: &HsmSession) -> HResult<()> {
    let identifier = random_identifier();
    let key = session.create_aes_key(
        &identifier,
        &generate_random_data::<24>()?,
        KeyPersistence::Session,
    )?;
    session.destroy_key(&key)?;
    let res = session.find_key(&identifier);
    assert!(matches!(res, Err(HError::KeyNotFound(_))), "{res:?}");
    Ok(())
}

pub fn invalid_key_size(session: &HsmSession) -> HResult<()> {
    let res = session.create_aes_key(
        &random_identifier(),
        &[0_u8; 20],
        KeyPersistence::Session,
    );
    assert!(
        matches!(res, Err(HError::Cipher(CipherError::InvalidKeySize(20)))),
        "{res:?}"
    );
    Ok(())
}

/// Threads sharing one cipher all see the software results.
pub fn concurrent_encryption(session: &HsmSession, threads: usize) -> HResult<()> {
    let (raw_key, key) = create_random_key::<32>(session)?;
    let hsm_cipher = HsmAesCipher::new(session, key)?;
    let software_cipher = SoftwareAesCipher::new(&raw_key)?;

    thread::scope(|scope| {
        let handles = (0..threads)
            .map(|_| {
                scope.spawn(|| -> HResult<()> {
                    for _ in 0..16 {
                        let block = generate_random_data::<AES_BLOCK_SIZE>()?;
                        let mut expected = [0_u8; AES_BLOCK_SIZE];
                        software_cipher.encrypt(&mut expected, &block)?;
                        let mut actual = [0_u8; AES_BLOCK_SIZE];
                        hsm_cipher.encrypt(&mut actual, &block)?;
                        assert_eq!(actual, expected);
                    }
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        handles.into_iter().try_for_each(|handle| {
            handle
                .join()
                .map_err(|_e| HError::Default("an encryption thread panicked".to_owned()))?
        })
    })?;
    info!("{threads} threads encrypted through the same session");
    session.destroy_key(&key)
}

/// Close `session` and check that every handle derived from it is refused.
///
/// The session is unusable afterwards; run this last.
pub fn session_closed(session: &HsmSession) -> HResult<()> {
    let key = session.create_aes_key(
        &random_identifier(),
        &APPENDIX_B_KEY,
        KeyPersistence::Session,
    )?;
    let cipher = HsmAesCipher::new(session, key)?;
    let alias = session.clone();

    session.close()?;
    assert!(!session.is_open());
    assert!(!alias.is_open());
    // closing twice is harmless
    alias.close()?;

    let mut dst = [0_u8; AES_BLOCK_SIZE];
    let res = cipher.encrypt(&mut dst, &APPENDIX_B_PLAINTEXT);
    assert!(matches!(res, Err(CipherError::SessionClosed)), "{res:?}");
    let res = cipher.decrypt(&mut dst, &APPENDIX_B_CIPHERTEXT);
    assert!(matches!(res, Err(CipherError::SessionClosed)), "{res:?}");
    let res = HsmAesCipher::new(session, key);
    assert!(matches!(res, Err(HError::SessionClosed)), "{res:?}");
    let res = session.get_info();
    assert!(matches!(res, Err(HError::SessionClosed)), "{res:?}");
    Ok(())
}

/// A wrong PIN leaves nothing behind: a second open succeeds.
pub fn wrong_pin_then_open<P: HsmProvider>(cfg: &HsmTestConfig) -> HResult<()> {
    log_init(None);
    let res = HsmSession::open_with_capabilities(
        &cfg.lib_path,
        "not the user pin",
        cfg.slot,
        P::capabilities(),
    );
    assert!(matches!(res, Err(HError::Authentication(_))), "{res:?}");

    let session = open_session::<P>(cfg)?;
    get_info(&session)?;
    session.close()
}
