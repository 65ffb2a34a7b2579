//! Client side of the HS-`ntor` key exchange used for the introduce/rendezvous
//! handshake in v3 onion services.
//!
//! Specified as "NTOR-WITH-EXTRA-DATA" in rend-spec-v3.txt. Adapted from the
//! client half of `tor_proto::crypto::handshake::hs_ntor`: the encryption
//! step used to build `INTRODUCE1`'s encrypted body, and the verification
//! step used to accept `RENDEZVOUS2`.
//!
//! This core treats the handshake as the single place where the "Critical
//! check" of §4.5 lives: [`HsNtorClientState::client_receive_rend`] is the
//! only function that computes and constant-time-compares `AUTH_MAC`.

#![allow(non_snake_case)]

use cipher::{KeyIvInit, StreamCipher};
use digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;
use tor_bytes::{Reader, SecretBuf, Writer};
use tor_error::into_internal;
use tor_hscrypto::ops::{hs_mac, HS_MAC_LEN};
use tor_hscrypto::pk::{HsIntroPtSessionIdKey, HsSvcNtorKey};
use tor_hscrypto::Subcredential;
use tor_llcrypto::cipher::aes::Aes256Ctr;
use tor_llcrypto::pk::{curve25519, ed25519};
use tor_llcrypto::util::ct::CtByteArray;
use zeroize::{Zeroize as _, Zeroizing};

/// Protocol identifier constant, as specified by rend-spec-v3.txt.
const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
/// Constant folded in when extracting the INTRODUCE1 encryption/MAC keys.
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
/// Constant used to expand the final session seed.
const T_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";
/// Constant folded into the rendezvous "verify" value.
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
/// Constant folded into the final `AUTH_INPUT_MAC`.
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
/// Literal "Server" tag folded into `auth_input`.
const SERVER_TAG: &[u8] = b"Server";
/// Bytes added by `encrypt_and_mac`'s framing (pubkey + MAC tag).
const ENC_OVERHEAD: usize = 32 + 32;
/// Default target length for the generated `INTRODUCE1` body.
const INTRO1_TARGET_LEN: usize = 490;

/// 256-bit encryption key derived for the INTRODUCE1 payload.
type EncKey = Zeroizing<[u8; 32]>;
/// 256-bit MAC key derived alongside [`EncKey`].
type MacKey = [u8; 32];
/// A 256-bit MAC tag, compared in constant time.
type MacTag = CtByteArray<HS_MAC_LEN>;

/// Expand `seed` into `n` bytes of keystream using SHAKE256, matching the
/// `ShakeKdf` used elsewhere in Tor's ntor-family handshakes.
fn shake_kdf(seed: &[u8], n: usize) -> Result<SecretBuf, tor_error::Bug> {
    let mut xof = Shake256::default();
    xof.update(seed);
    let mut reader = xof.finalize_xof();
    let mut out = vec![0_u8; n];
    reader.read(&mut out);
    Ok(out.into())
}

/// Seed material from which end-to-end session keys are expanded.
///
/// Installed onto the rendezvous circuit's virtual hop via
/// [`crate::ports::CircuitOps::setup_e2e_keys`].
pub struct NtorKeySeed(SecretBuf);

impl NtorKeySeed {
    /// Expand this seed into `keylen` bytes of keystream.
    pub fn expand(&self, keylen: usize) -> Result<SecretBuf, tor_error::Bug> {
        shake_kdf(&self.0[..], keylen)
    }
}

/// Everything a client needs to know about the service/intro-point it is
/// handshaking with.
#[derive(Clone)]
pub struct ServiceInfo {
    /// Introduction point's ntor encryption key (`KP_hss_ntor`, aka `B`).
    pub enc_key: HsSvcNtorKey,
    /// Introduction point session/auth key (`KP_hs_ipt_sid`, aka `AUTH_KEY`).
    pub auth_key: HsIntroPtSessionIdKey,
    /// Service subcredential for the current time period.
    pub subcredential: Subcredential,
}

/// Client-side state for one introduction/rendezvous handshake attempt.
///
/// One of these is created per `INTRODUCE1` we send; it is consumed when the
/// matching `RENDEZVOUS2` (or a timeout) arrives.
pub struct HsNtorClientState {
    /// Information about the introduction point we're handshaking with.
    service_info: ServiceInfo,
    /// Our ephemeral Curve25519 secret for this handshake.
    x: curve25519::StaticSecret,
    /// The corresponding public key, sent to the service as `CLIENT_PK`.
    X: curve25519::PublicKey,
    /// `EXP(B, x)`, the shared secret usable once we know the service's `B`.
    Bx: curve25519::SharedSecret,
}

impl HsNtorClientState {
    /// Begin a new handshake towards `service_info`, using `rng` to generate
    /// our ephemeral keypair.
    pub fn new<R: rand::RngCore + rand::CryptoRng>(rng: &mut R, service_info: ServiceInfo) -> Self {
        let x = curve25519::StaticSecret::random_from_rng(rng);
        let X = curve25519::PublicKey::from(&x);
        let Bx = x.diffie_hellman(&service_info.enc_key);
        HsNtorClientState {
            service_info,
            x,
            X,
            Bx,
        }
    }

    /// Our ephemeral public key for this handshake attempt (`CLIENT_PK`).
    pub fn public_key(&self) -> curve25519::PublicKey {
        self.X
    }

    /// Compute the encrypted body to place in an `INTRODUCE1` cell: our
    /// ephemeral public key, followed by `plaintext_body` encrypted and
    /// padded to a fixed target length, followed by a MAC over
    /// `(intro_header, CLIENT_PK, ciphertext)`.
    pub fn client_send_intro(
        &self,
        intro_header: &[u8],
        plaintext_body: &[u8],
    ) -> Result<Vec<u8>, tor_error::Bug> {
        let (enc_key, mac_key) = get_introduce_key_material(
            &self.Bx,
            &self.service_info.auth_key,
            &self.X,
            &self.service_info.enc_key,
            &self.service_info.subcredential,
        )?;

        let padded_target_len =
            INTRO1_TARGET_LEN.saturating_sub(intro_header.len() + ENC_OVERHEAD);
        let mut padded_body = plaintext_body.to_vec();
        if padded_body.len() < padded_target_len {
            padded_body.resize(padded_target_len, 0);
        }

        let (ciphertext, mac_tag) =
            encrypt_and_mac(&padded_body, intro_header, &self.X, &enc_key, mac_key);
        padded_body.zeroize();

        let mut out = Vec::new();
        out.write(&self.X)
            .and_then(|_| out.write(&ciphertext))
            .and_then(|_| out.write(&mac_tag))
            .map_err(into_internal!("cannot encode hs-ntor client handshake"))?;
        Ok(out)
    }

    /// Handle the `RENDEZVOUS2` payload: a 32-byte service public key `Y`
    /// followed by a 32-byte `AUTH_MAC`.
    ///
    /// This is the single place the "Critical check" from the rendezvous
    /// state machine lives: the received `AUTH_MAC` is compared against the
    /// one we compute, in constant time, and a mismatch is the only reason
    /// this function returns `Err`.
    pub fn client_receive_rend(&self, msg: &[u8]) -> Result<NtorKeySeed, RendezvousAuthError> {
        let mut cur = Reader::from_slice(msg);
        let Y: curve25519::PublicKey = cur
            .extract()
            .map_err(|_| RendezvousAuthError::Malformed)?;
        let mac_tag: MacTag = cur
            .extract()
            .map_err(|_| RendezvousAuthError::Malformed)?;

        let xy = self.x.diffie_hellman(&Y);
        let xb = self.x.diffie_hellman(&self.service_info.enc_key);

        let (seed, expected_mac) = get_rendezvous_key_material(
            &xy,
            &xb,
            &self.service_info.auth_key,
            &self.service_info.enc_key,
            &self.X,
            &Y,
        )
        .map_err(RendezvousAuthError::Internal)?;

        // Constant-time compare: `CtByteArray`'s `PartialEq` is itself
        // constant-time, but we spell this out because it is the property
        // the design calls out explicitly (I6).
        if expected_mac != mac_tag {
            return Err(RendezvousAuthError::BadMac);
        }
        Ok(seed)
    }
}

/// The `RENDEZVOUS2` handshake failed verification.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RendezvousAuthError {
    /// The cell was too short or otherwise not parseable.
    #[error("malformed RENDEZVOUS2 payload")]
    Malformed,
    /// The `AUTH_MAC` did not match what we computed: the service does not
    /// know the key material we expect, or the cell was tampered with.
    #[error("RENDEZVOUS2 authentication failed")]
    BadMac,
    /// An internal error occurred while deriving key material.
    #[error("internal error deriving rendezvous key material")]
    Internal(tor_error::Bug),
}

/// Encrypt `plaintext` under `enc_key` (AES-256-CTR, zero IV, as specified),
/// then MAC `(other_data, public_key, ciphertext)` under `mac_key`.
fn encrypt_and_mac(
    plaintext: &[u8],
    other_data: &[u8],
    public_key: &curve25519::PublicKey,
    enc_key: &EncKey,
    mac_key: MacKey,
) -> (Vec<u8>, MacTag) {
    let mut ciphertext = plaintext.to_vec();
    let zero_iv = Default::default();
    let mut cipher = Aes256Ctr::new(enc_key.as_ref().into(), &zero_iv);
    cipher.apply_keystream(&mut ciphertext);

    let mut mac_body = Vec::new();
    mac_body.extend(other_data);
    mac_body.extend(public_key.as_bytes());
    mac_body.extend(&ciphertext);
    let mac_tag = hs_mac(&mac_key, &mac_body);

    (ciphertext, mac_tag)
}

/// Derive `(ENC_KEY, MAC_KEY)` used to protect the `INTRODUCE1` payload.
fn get_introduce_key_material(
    bx: &curve25519::SharedSecret,
    auth_key: &ed25519::PublicKey,
    X: &curve25519::PublicKey,
    B: &curve25519::PublicKey,
    subcredential: &Subcredential,
) -> Result<(EncKey, MacKey), tor_error::Bug> {
    let mut secret_input = SecretBuf::new();
    secret_input
        .write(bx)
        .and_then(|_| secret_input.write(auth_key))
        .and_then(|_| secret_input.write(X))
        .and_then(|_| secret_input.write(B))
        .and_then(|_| secret_input.write(PROTOID))
        .and_then(|_| secret_input.write(T_HSENC))
        .and_then(|_| secret_input.write(T_HSEXPAND))
        .and_then(|_| secret_input.write(subcredential))
        .map_err(into_internal!("cannot build hs-ntor kdf input"))?;

    let hs_keys = shake_kdf(&secret_input[..], 64)?;
    let enc_key: EncKey = Zeroizing::new(
        hs_keys[0..32]
            .try_into()
            .map_err(into_internal!("converting enc_key"))?,
    );
    let mac_key: MacKey = hs_keys[32..64]
        .try_into()
        .map_err(into_internal!("converting mac_key"))?;
    Ok((enc_key, mac_key))
}

/// Derive `(NtorKeySeed, AUTH_INPUT_MAC)` for the rendezvous phase.
fn get_rendezvous_key_material(
    xy: &curve25519::SharedSecret,
    xb: &curve25519::SharedSecret,
    auth_key: &ed25519::PublicKey,
    B: &curve25519::PublicKey,
    X: &curve25519::PublicKey,
    Y: &curve25519::PublicKey,
) -> Result<(NtorKeySeed, MacTag), tor_error::Bug> {
    let mut secret_input = SecretBuf::new();
    secret_input
        .write(xy)
        .and_then(|_| secret_input.write(xb))
        .and_then(|_| secret_input.write(auth_key))
        .and_then(|_| secret_input.write(B))
        .and_then(|_| secret_input.write(X))
        .and_then(|_| secret_input.write(Y))
        .and_then(|_| secret_input.write(PROTOID))
        .map_err(into_internal!("cannot encode hs-ntor rendezvous input"))?;

    let ntor_key_seed = hs_mac(&secret_input, T_HSENC);
    let verify = hs_mac(&secret_input, T_HSVERIFY);

    let mut auth_input = Vec::new();
    auth_input
        .write(&verify)
        .and_then(|_| auth_input.write(auth_key))
        .and_then(|_| auth_input.write(B))
        .and_then(|_| auth_input.write(Y))
        .and_then(|_| auth_input.write(X))
        .and_then(|_| auth_input.write(PROTOID))
        .and_then(|_| auth_input.write(SERVER_TAG))
        .map_err(into_internal!("cannot encode hs-ntor auth-input"))?;
    let auth_input_mac = hs_mac(&auth_input, T_HSMAC);

    let mut kdf_seed = SecretBuf::new();
    kdf_seed
        .write(&ntor_key_seed)
        .and_then(|_| kdf_seed.write(T_HSEXPAND))
        .map_err(into_internal!("cannot encode hs-ntor kdf seed"))?;

    Ok((NtorKeySeed(kdf_seed), auth_input_mac))
}

/// Test-only access to the rendezvous key-derivation helper, used by
/// [`crate::rsm`]'s tests to emulate the service side of a handshake.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn get_rendezvous_key_material_pub(
        xy: &curve25519::SharedSecret,
        xb: &curve25519::SharedSecret,
        auth_key: &ed25519::PublicKey,
        B: &curve25519::PublicKey,
        X: &curve25519::PublicKey,
        Y: &curve25519::PublicKey,
    ) -> Result<(NtorKeySeed, MacTag), tor_error::Bug> {
        get_rendezvous_key_material(xy, xb, auth_key, B, X, Y)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tor_hscrypto::pk::HsSvcNtorKeypair;
    use tor_llcrypto::pk::ed25519;

    fn test_rng() -> rand::rngs::StdRng {
        use rand::SeedableRng;
        rand::rngs::StdRng::seed_from_u64(0xDEADBEEF)
    }

    #[test]
    fn round_trip_handshake_succeeds() {
        let mut rng = test_rng();
        let intro_b_privkey = curve25519::StaticSecret::random_from_rng(&mut rng);
        let intro_b_pubkey = curve25519::PublicKey::from(&intro_b_privkey);
        let intro_auth_key_kp = ed25519::Keypair::generate(&mut rng);
        let intro_auth_key_pub = ed25519::PublicKey::from(&intro_auth_key_kp);

        let service_info = ServiceInfo {
            enc_key: intro_b_pubkey.into(),
            auth_key: intro_auth_key_pub.into(),
            subcredential: [5; 32].into(),
        };
        let client = HsNtorClientState::new(&mut rng, service_info.clone());
        let cmsg = client
            .client_send_intro(&[66; 10], &[42; 60])
            .expect("encode should succeed");
        assert_eq!(cmsg.len() + 10, INTRO1_TARGET_LEN);

        // Emulate the service side using the same helper functions (acting
        // as our own test oracle, since the real service lives outside this
        // crate's scope).
        let k_hss_ntor = HsSvcNtorKeypair::from_secret_key(intro_b_privkey.into());
        let mut cur = Reader::from_slice(&cmsg);
        let X: curve25519::PublicKey = cur.extract().unwrap();
        let remaining = cur.remaining();
        let mut ciphertext = cur.take(remaining - HS_MAC_LEN).unwrap().to_vec();
        let received_mac: MacTag = cur.extract().unwrap();
        let bx = k_hss_ntor.secret().as_ref().diffie_hellman(&X);
        let (dec_key, mac_key) = get_introduce_key_material(
            &bx,
            &service_info.auth_key,
            &X,
            &service_info.enc_key,
            &service_info.subcredential,
        )
        .unwrap();
        let mut mac_body = Vec::new();
        mac_body.extend(&[66_u8; 10]);
        mac_body.extend(X.as_bytes());
        mac_body.extend(&ciphertext);
        assert_eq!(hs_mac(&mac_key, &mac_body), received_mac);
        let zero_iv = Default::default();
        let mut cipher = Aes256Ctr::new(dec_key.as_ref().into(), &zero_iv);
        cipher.apply_keystream(&mut ciphertext);
        assert_eq!(&ciphertext[0..60], &[42_u8; 60]);

        let y = curve25519::StaticSecret::random_from_rng(&mut rng);
        let Y = curve25519::PublicKey::from(&y);
        let xy = y.diffie_hellman(&X);
        let xb = k_hss_ntor.secret().as_ref().diffie_hellman(&X);
        let (service_seed, auth_mac) = get_rendezvous_key_material(
            &xy,
            &xb,
            &service_info.auth_key,
            &service_info.enc_key,
            &X,
            &Y,
        )
        .unwrap();
        let mut reply = Vec::new();
        reply.write(&Y).unwrap();
        reply.write(&auth_mac).unwrap();

        let client_seed = client
            .client_receive_rend(&reply)
            .expect("valid RENDEZVOUS2 should verify");
        assert_eq!(
            client_seed.expand(128).unwrap(),
            service_seed.expand(128).unwrap()
        );
    }

    /// I6 / scenario 4: a tampered AUTH_MAC must be rejected.
    #[test]
    fn tampered_mac_is_rejected() {
        let mut rng = test_rng();
        let intro_b_privkey = curve25519::StaticSecret::random_from_rng(&mut rng);
        let intro_b_pubkey = curve25519::PublicKey::from(&intro_b_privkey);
        let intro_auth_key_kp = ed25519::Keypair::generate(&mut rng);
        let intro_auth_key_pub = ed25519::PublicKey::from(&intro_auth_key_kp);
        let service_info = ServiceInfo {
            enc_key: intro_b_pubkey.into(),
            auth_key: intro_auth_key_pub.into(),
            subcredential: [5; 32].into(),
        };
        let client = HsNtorClientState::new(&mut rng, service_info.clone());

        let k_hss_ntor = HsSvcNtorKeypair::from_secret_key(intro_b_privkey.into());
        let y = curve25519::StaticSecret::random_from_rng(&mut rng);
        let Y = curve25519::PublicKey::from(&y);
        let xy = y.diffie_hellman(&client.X);
        let xb = k_hss_ntor.secret().as_ref().diffie_hellman(&client.X);
        let (_seed, auth_mac) = get_rendezvous_key_material(
            &xy,
            &xb,
            &service_info.auth_key,
            &service_info.enc_key,
            &client.X,
            &Y,
        )
        .unwrap();

        let mut tampered = auth_mac;
        tampered.as_mut()[0] ^= 0xFF;
        let mut reply = Vec::new();
        reply.write(&Y).unwrap();
        reply.write(&tampered).unwrap();

        let err = client
            .client_receive_rend(&reply)
            .expect_err("tampered MAC must not verify");
        assert!(matches!(err, RendezvousAuthError::BadMac));
    }
}
