//! Complete synthetic connections, encrypted with real keys, fed through the public API.

use aes::{
    cipher::{KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek},
    Aes128,
};
use aes_gcm::{aead::AeadInPlace, Aes128Gcm, Nonce};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use chacha20::ChaCha20Legacy;
use ctr::Ctr128BE;
use minissh_dissect::{
    crypto::{HashAlgorithm, KeyMaterial},
    keys::{KeyScheduler, SessionKeys},
    sink::OwnedValue,
    ChannelContext, Config, Context, Diagnostic, Direction, Field, FrameId, KeylogStore,
    Progress, Recorder, SessionState, Source, Subsystem,
};
use num_bigint::BigUint;
use poly1305::Poly1305;
use ring::hmac;

const CLIENT: Direction = Direction::ClientToServer;
const SERVER: Direction = Direction::ServerToClient;

const CLIENT_BANNER: &[u8] = b"SSH-2.0-OpenSSH_9.6";
const SERVER_BANNER: &[u8] = b"SSH-2.0-OpenSSH_9.6p1 Debian-4";

const MSG_IGNORE: u8 = 2;
const MSG_SERVICE_REQUEST: u8 = 5;
const MSG_SERVICE_ACCEPT: u8 = 6;
const MSG_KEXINIT: u8 = 20;
const MSG_NEWKEYS: u8 = 21;
const MSG_KEX_ECDH_INIT: u8 = 30;
const MSG_KEX_ECDH_REPLY: u8 = 31;
const MSG_KEXDH_INIT: u8 = 30;
const MSG_KEXDH_REPLY: u8 = 31;
const MSG_KEX_DH_GEX_REQUEST_OLD: u8 = 30;
const MSG_KEX_DH_GEX_GROUP: u8 = 31;
const MSG_KEX_DH_GEX_INIT: u8 = 32;
const MSG_KEX_DH_GEX_REPLY: u8 = 33;
const MSG_KEX_DH_GEX_REQUEST: u8 = 34;
const MSG_USERAUTH_REQUEST: u8 = 50;
const MSG_USERAUTH_SUCCESS: u8 = 52;
const MSG_CHANNEL_OPEN: u8 = 90;
const MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
const MSG_CHANNEL_DATA: u8 = 94;
const MSG_CHANNEL_CLOSE: u8 = 97;
const MSG_CHANNEL_REQUEST: u8 = 98;

// ==== wire helpers ====

fn put_string(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s);
}

fn put_mpint(buf: &mut Vec<u8>, s: &[u8]) {
    let s = &s[s.iter().take_while(|&&b| b == 0).count()..];
    if s.first().map_or(false, |&b| b & 0x80 != 0) {
        put_string(buf, &[&[0u8][..], s].concat());
    } else {
        put_string(buf, s);
    }
}

/// A binary packet whose total length is a multiple of `block`.
fn packet(payload: &[u8], block: usize) -> Vec<u8> {
    padded(payload, block, 4)
}

/// A binary packet where `counted` bytes of the length field take part in the alignment.
fn padded(payload: &[u8], block: usize, counted: usize) -> Vec<u8> {
    let mut padding = block - (counted + 1 + payload.len()) % block;
    if padding < 4 {
        padding += block;
    }
    let mut buf = vec![];
    buf.extend_from_slice(&((1 + payload.len() + padding) as u32).to_be_bytes());
    buf.push(padding as u8);
    buf.extend_from_slice(payload);
    buf.extend(std::iter::repeat(0x5c).take(padding));
    buf
}

fn message(code: u8, build: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut payload = vec![code];
    build(&mut payload);
    payload
}

fn x25519_pair(seed: u8) -> Result<(KeyMaterial, KeyMaterial)> {
    let private = KeyMaterial::new(vec![seed; 32]);
    let mut base = [0u8; 32];
    base[0] = 9;
    let public = private.x25519(&KeyMaterial::new(base.to_vec()))?;
    Ok((private, public))
}

fn host_key() -> Vec<u8> {
    let mut blob = vec![];
    put_string(&mut blob, b"ssh-ed25519");
    put_string(&mut blob, &[0x5a; 32]);
    blob
}

fn signature() -> Vec<u8> {
    let mut blob = vec![];
    put_string(&mut blob, b"ssh-ed25519");
    put_string(&mut blob, &[0x6b; 64]);
    blob
}

fn kexinit(cookie: &[u8; 16], kex: &str, enc: &str, mac: &str) -> Vec<u8> {
    message(MSG_KEXINIT, |p| {
        p.extend_from_slice(cookie);
        for list in &[kex, "ssh-ed25519", enc, enc, mac, mac, "none", "none", "", ""] {
            put_string(p, list.as_bytes());
        }
        p.push(0);
        p.extend_from_slice(&[0; 4]);
    })
}

/// The start of the exchange hash input shared by every method.
fn transcript_prefix(client_kexinit: &[u8], server_kexinit: &[u8]) -> Vec<u8> {
    let mut buf = vec![];
    put_string(&mut buf, CLIENT_BANNER);
    put_string(&mut buf, SERVER_BANNER);
    put_string(&mut buf, client_kexinit);
    put_string(&mut buf, server_kexinit);
    put_string(&mut buf, &host_key());
    buf
}

// ==== key exchange ====

struct Handshake {
    client_cookie: [u8; 16],
    server_cookie: [u8; 16],
    client_kexinit: Vec<u8>,
    server_kexinit: Vec<u8>,
    client: (KeyMaterial, KeyMaterial),
    server: (KeyMaterial, KeyMaterial),
}

impl Handshake {
    fn new(enc: &str, mac: &str, seed: u8) -> Result<Self> {
        let client_cookie = [seed; 16];
        let server_cookie = [seed.wrapping_add(1); 16];
        Ok(Self {
            client_cookie,
            server_cookie,
            client_kexinit: kexinit(
                &client_cookie,
                "curve25519-sha256,diffie-hellman-group14-sha256",
                enc,
                mac,
            ),
            server_kexinit: kexinit(&server_cookie, "curve25519-sha256", enc, mac),
            client: x25519_pair(seed.wrapping_add(0x10))?,
            server: x25519_pair(seed.wrapping_add(0x20))?,
        })
    }

    fn ecdh_init(&self) -> Vec<u8> {
        message(MSG_KEX_ECDH_INIT, |p| put_string(p, self.client.1.as_bytes()))
    }

    fn ecdh_reply(&self) -> Vec<u8> {
        message(MSG_KEX_ECDH_REPLY, |p| {
            put_string(p, &host_key());
            put_string(p, self.server.1.as_bytes());
            put_string(p, &signature());
        })
    }

    /// The exchange hash and the keys derived from it.
    fn keys(&self, session_id: Option<&[u8]>) -> Result<(Bytes, SessionKeys)> {
        let k = self.server.0.x25519(&self.client.1)?;

        let mut buf = transcript_prefix(&self.client_kexinit, &self.server_kexinit);
        put_string(&mut buf, self.client.1.as_bytes());
        put_string(&mut buf, self.server.1.as_bytes());
        put_mpint(&mut buf, k.as_bytes());
        let h = HashAlgorithm::Sha256.digest(&buf);

        let session_id = session_id.map_or_else(|| h.clone(), Bytes::copy_from_slice);
        let keys = KeyScheduler::new(HashAlgorithm::Sha256, &k, &h, &session_id).derive();
        Ok((h, keys))
    }
}

/// RFC 3526 group 14.
const MODP_2048: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// Finite field Diffie-Hellman with both exponents known.
struct DhExchange {
    client_cookie: [u8; 16],
    server_cookie: [u8; 16],
    client_kexinit: Vec<u8>,
    server_kexinit: Vec<u8>,
    p: BigUint,
    g: BigUint,
    x: BigUint,
    y: BigUint,
}

impl DhExchange {
    fn new(kex: &str, enc: &str, mac: &str, p: BigUint, seed: u8) -> Self {
        let client_cookie = [seed; 16];
        let server_cookie = [seed.wrapping_add(1); 16];
        let g = BigUint::from(2u8);
        let x = BigUint::from_bytes_be(&[seed.wrapping_add(0x10); 24]);
        let mut y = BigUint::from_bytes_be(&[seed.wrapping_add(0x20); 24]);
        // f as wide as p, whose top bit is set, so its mpint starts with a zero byte
        while g.modpow(&y, &p).bits() != p.bits() {
            y += 1u8;
        }
        Self {
            client_cookie,
            server_cookie,
            client_kexinit: kexinit(&client_cookie, kex, enc, mac),
            server_kexinit: kexinit(&server_cookie, kex, enc, mac),
            p,
            g,
            x,
            y,
        }
    }

    fn e(&self) -> Vec<u8> {
        self.g.modpow(&self.x, &self.p).to_bytes_be()
    }

    fn f(&self) -> Vec<u8> {
        self.g.modpow(&self.y, &self.p).to_bytes_be()
    }

    fn k(&self) -> Vec<u8> {
        self.g
            .modpow(&self.x, &self.p)
            .modpow(&self.y, &self.p)
            .to_bytes_be()
    }

    fn group(&self) -> Vec<u8> {
        message(MSG_KEX_DH_GEX_GROUP, |b| {
            put_mpint(b, &self.p.to_bytes_be());
            put_mpint(b, &self.g.to_bytes_be());
        })
    }

    fn init(&self, code: u8) -> Vec<u8> {
        message(code, |b| put_mpint(b, &self.e()))
    }

    fn reply(&self, code: u8) -> Vec<u8> {
        message(code, |b| {
            put_string(b, &host_key());
            put_mpint(b, &self.f());
            put_string(b, &signature());
        })
    }

    /// The exchange hash, built by hand. `group_fields` is what group exchange hashes
    /// between the host key and `e`.
    fn keys(&self, group_fields: &[u8]) -> (Bytes, SessionKeys) {
        let k = KeyMaterial::new(self.k());
        let mut buf = transcript_prefix(&self.client_kexinit, &self.server_kexinit);
        buf.extend_from_slice(group_fields);
        put_mpint(&mut buf, &self.e());
        put_mpint(&mut buf, &self.f());
        put_mpint(&mut buf, k.as_bytes());
        let h = HashAlgorithm::Sha256.digest(&buf);
        let keys = KeyScheduler::new(HashAlgorithm::Sha256, &k, &h, &h).derive();
        (h, keys)
    }
}

// ==== record protection ====

struct CtrSealer {
    cipher: Ctr128BE<Aes128>,
    mac_key: hmac::Key,
    sequence_number: u32,
}

impl CtrSealer {
    fn new(keys: &SessionKeys, direction: Direction, sequence_number: u32) -> Result<Self> {
        let keys = keys.for_direction(direction);
        let cipher = Ctr128BE::<Aes128>::new_from_slices(&keys.enc[..16], &keys.iv[..16])
            .map_err(|_| anyhow!("bad key length"))?;
        Ok(Self {
            cipher,
            mac_key: hmac::Key::new(hmac::HMAC_SHA256, &keys.mac[..32]),
            sequence_number,
        })
    }

    fn seal(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut record = packet(payload, 16);
        let mut mac = hmac::Context::with_key(&self.mac_key);
        mac.update(&self.sequence_number.to_be_bytes());
        mac.update(&record);
        let tag = mac.sign();

        self.cipher.apply_keystream(&mut record);
        record.extend_from_slice(tag.as_ref());
        self.sequence_number += 1;
        record
    }
}

struct ChaChaSealer {
    main_key: [u8; 32],
    header_key: [u8; 32],
    sequence_number: u32,
}

impl ChaChaSealer {
    fn new(keys: &SessionKeys, direction: Direction, sequence_number: u32) -> Self {
        let keys = keys.for_direction(direction);
        let mut main_key = [0u8; 32];
        let mut header_key = [0u8; 32];
        main_key.copy_from_slice(&keys.enc[..32]);
        header_key.copy_from_slice(&keys.enc[32..64]);
        Self {
            main_key,
            header_key,
            sequence_number,
        }
    }

    fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut record = packet(payload, 8);
        let nonce = u64::from(self.sequence_number).to_be_bytes();

        ChaCha20Legacy::new_from_slices(&self.header_key, &nonce)
            .map_err(|_| anyhow!("bad key length"))?
            .apply_keystream(&mut record[..4]);

        let mut main = ChaCha20Legacy::new_from_slices(&self.main_key, &nonce)
            .map_err(|_| anyhow!("bad key length"))?;
        let mut poly_key = [0u8; 32];
        main.apply_keystream(&mut poly_key);
        main.seek(64u64);
        main.apply_keystream(&mut record[4..]);

        let tag = Poly1305::new_from_slice(&poly_key)
            .map_err(|_| anyhow!("bad key length"))?
            .compute_unpadded(&record);
        record.extend_from_slice(tag.as_slice());
        self.sequence_number += 1;
        Ok(record)
    }
}

struct GcmSealer {
    cipher: Aes128Gcm,
    nonce: [u8; 12],
}

impl GcmSealer {
    fn new(keys: &SessionKeys, direction: Direction) -> Result<Self> {
        let keys = keys.for_direction(direction);
        let cipher =
            Aes128Gcm::new_from_slice(&keys.enc[..16]).map_err(|_| anyhow!("bad key length"))?;
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&keys.iv[..12]);
        Ok(Self { cipher, nonce })
    }

    fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut record = padded(payload, 16, 0);
        let (aad, body) = record.split_at_mut(4);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&self.nonce), aad, body)
            .map_err(|_| anyhow!("cannot seal"))?;
        record.extend_from_slice(tag.as_slice());

        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.nonce[4..]);
        let counter = u64::from_be_bytes(counter) + 1;
        self.nonce[4..].copy_from_slice(&counter.to_be_bytes());
        Ok(record)
    }
}

// ==== capture ====

struct Capture {
    session: SessionState,
    config: Config,
    keylog: KeylogStore,
    sink: Recorder,
    sftp: Vec<(Direction, u32, Vec<u8>)>,
    frame: u32,
}

impl Capture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            session: SessionState::new(),
            config: Config::default(),
            keylog: KeylogStore::new(),
            sink: Recorder::new(),
            sftp: vec![],
            frame: 0,
        }
    }

    fn feed(&mut self, direction: Direction, data: &[u8]) -> Progress {
        self.frame += 1;
        let sftp = &mut self.sftp;
        let mut dispatch = |subsystem: Subsystem, bytes: &[u8], cx: &ChannelContext| {
            assert_eq!(subsystem, Subsystem::Sftp);
            sftp.push((cx.direction, cx.channel.0, bytes.to_vec()));
        };
        let mut cx = Context {
            config: &self.config,
            keylog: &self.keylog,
            sink: &mut self.sink,
            subsystems: &mut dispatch,
        };
        self.session
            .dissect(direction, FrameId(self.frame), data, &mut cx)
    }

    fn feed_all(&mut self, direction: Direction, data: &[u8]) -> Result<()> {
        match self.feed(direction, data) {
            Progress::Complete { next_offset } if next_offset == data.len() => Ok(()),
            progress => Err(anyhow!("{:?} stopped at {:?}", direction, progress)),
        }
    }

    fn banners(&mut self, client_kexinit: &[u8], server_kexinit: &[u8]) -> Result<()> {
        self.feed_all(CLIENT, &[CLIENT_BANNER, b"\r\n"].concat())?;
        self.feed_all(SERVER, &[SERVER_BANNER, b"\r\n"].concat())?;
        self.feed_all(CLIENT, &packet(client_kexinit, 8))?;
        self.feed_all(SERVER, &packet(server_kexinit, 8))
    }

    fn handshake(&mut self, hs: &Handshake) -> Result<()> {
        self.banners(&hs.client_kexinit, &hs.server_kexinit)?;
        self.feed_all(CLIENT, &packet(&hs.ecdh_init(), 8))?;

        let mut reply = packet(&hs.ecdh_reply(), 8);
        reply.extend_from_slice(&packet(&[MSG_NEWKEYS], 8));
        self.feed_all(SERVER, &reply)?;
        self.feed_all(CLIENT, &packet(&[MSG_NEWKEYS], 8))
    }

    fn texts(&self, field: Field) -> Vec<String> {
        self.sink
            .all(field)
            .filter_map(|r| match r.value {
                OwnedValue::Text(ref s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }
}

// ==== messages ====

fn service(code: u8) -> Vec<u8> {
    message(code, |p| put_string(p, b"ssh-userauth"))
}

fn password_request(user: &str, password: &str) -> Vec<u8> {
    message(MSG_USERAUTH_REQUEST, |p| {
        put_string(p, user.as_bytes());
        put_string(p, b"ssh-connection");
        put_string(p, b"password");
        p.push(0);
        put_string(p, password.as_bytes());
    })
}

fn channel_data(recipient: u32, data: &[u8]) -> Vec<u8> {
    message(MSG_CHANNEL_DATA, |p| {
        p.extend_from_slice(&recipient.to_be_bytes());
        put_string(p, data);
    })
}

// ==== tests ====

#[test]
fn aes_ctr_session_is_decrypted() -> Result<()> {
    let hs = Handshake::new("aes128-ctr", "hmac-sha2-256", 0x40)?;
    let mut c = Capture::new();
    c.keylog.insert(hs.server_cookie, hs.server.0.clone());
    c.handshake(&hs)?;

    let (h, keys) = hs.keys(None)?;
    assert_eq!(c.session.session_id(), Some(&h[..]));
    assert!(c.session.peer(CLIENT).is_keyed());
    assert!(c.session.peer(SERVER).is_keyed());

    let mut client = CtrSealer::new(&keys, CLIENT, 3)?;
    let mut server = CtrSealer::new(&keys, SERVER, 3)?;
    c.feed_all(CLIENT, &client.seal(&service(MSG_SERVICE_REQUEST)))?;
    c.feed_all(SERVER, &server.seal(&service(MSG_SERVICE_ACCEPT)))?;

    // one record over two segments
    let record = client.seal(&password_request("alice", "hunter2"));
    assert_eq!(
        c.feed(CLIENT, &record[..20]),
        Progress::NeedMore {
            resume_offset: 0,
            hint: Some(record.len() - 20)
        }
    );
    assert!(c.session.peer(CLIENT).pending_fragment().is_some());
    c.feed_all(CLIENT, &record)?;
    c.feed_all(SERVER, &server.seal(&[MSG_USERAUTH_SUCCESS]))?;

    assert!(c.sink.diagnostics.is_empty(), "{:?}", c.sink.diagnostics);
    assert_eq!(
        c.texts(Field::ServiceName),
        ["ssh-userauth", "ssh-userauth", "ssh-connection"]
    );
    let password = c
        .sink
        .find(Field::Password)
        .ok_or_else(|| anyhow!("no password"))?;
    assert_eq!(password.value, OwnedValue::Text("hunter2".into()));
    assert_eq!(
        password.span.source,
        Source::Decrypted {
            direction: CLIENT,
            sequence_number: 4
        }
    );
    assert_eq!(c.sink.plaintexts.len(), 4);
    assert_eq!(c.session.peer(CLIENT).sequence_number(), 5);
    assert_eq!(c.session.peer(SERVER).sequence_number(), 5);
    Ok(())
}

#[test]
fn sftp_over_chacha20_poly1305() -> Result<()> {
    let hs = Handshake::new("chacha20-poly1305@openssh.com", "hmac-sha2-256", 0x60)?;
    let mut c = Capture::new();
    // only the client's key is known
    c.keylog.insert(hs.client_cookie, hs.client.0.clone());
    c.handshake(&hs)?;

    let (_, keys) = hs.keys(None)?;
    let mut client = ChaChaSealer::new(&keys, CLIENT, 3);
    let mut server = ChaChaSealer::new(&keys, SERVER, 3);

    let open = message(MSG_CHANNEL_OPEN, |p| {
        put_string(p, b"session");
        p.extend_from_slice(&0u32.to_be_bytes());
        p.extend_from_slice(&0x20_0000u32.to_be_bytes());
        p.extend_from_slice(&0x8000u32.to_be_bytes());
    });
    let confirmation = message(MSG_CHANNEL_OPEN_CONFIRMATION, |p| {
        p.extend_from_slice(&0u32.to_be_bytes());
        p.extend_from_slice(&7u32.to_be_bytes());
        p.extend_from_slice(&0u32.to_be_bytes());
        p.extend_from_slice(&0x8000u32.to_be_bytes());
    });
    let subsystem = message(MSG_CHANNEL_REQUEST, |p| {
        p.extend_from_slice(&7u32.to_be_bytes());
        put_string(p, b"subsystem");
        p.push(1);
        put_string(p, b"sftp");
    });
    let sftp_init = [0, 0, 0, 5, 1, 0, 0, 0, 3];
    let sftp_version = [0, 0, 0, 5, 2, 0, 0, 0, 3];

    c.feed_all(CLIENT, &client.seal(&open)?)?;
    c.feed_all(SERVER, &server.seal(&confirmation)?)?;
    c.feed_all(CLIENT, &client.seal(&subsystem)?)?;
    c.feed_all(CLIENT, &client.seal(&channel_data(7, &sftp_init))?)?;
    c.feed_all(SERVER, &server.seal(&channel_data(0, &sftp_version))?)?;

    // a bad tag is reported but the record is still dissected
    let mut tampered = client.seal(&channel_data(7, b"tampered"))?;
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    c.feed_all(CLIENT, &tampered)?;

    let close = message(MSG_CHANNEL_CLOSE, |p| p.extend_from_slice(&7u32.to_be_bytes()));
    c.feed_all(CLIENT, &client.seal(&close)?)?;
    c.feed_all(CLIENT, &client.seal(&channel_data(7, b"late"))?)?;

    assert_eq!(
        c.sftp,
        [
            (CLIENT, 7, sftp_init.to_vec()),
            (SERVER, 0, sftp_version.to_vec()),
            (CLIENT, 7, b"tampered".to_vec()),
        ]
    );
    let diagnostics: Vec<_> = c.sink.diagnostics.iter().map(|(_, d)| *d).collect();
    assert_eq!(
        diagnostics,
        [Diagnostic::MacMismatch {
            sequence_number: 6
        }]
    );
    assert_eq!(c.texts(Field::SubsystemName), ["sftp"]);
    Ok(())
}

#[test]
fn rekey_keeps_session_id() -> Result<()> {
    let first = Handshake::new("aes128-ctr", "hmac-sha2-256", 0x80)?;
    let mut c = Capture::new();
    c.keylog.insert(first.server_cookie, first.server.0.clone());
    c.handshake(&first)?;
    let (h1, keys) = first.keys(None)?;

    let mut client = CtrSealer::new(&keys, CLIENT, 3)?;
    let mut server = CtrSealer::new(&keys, SERVER, 3)?;
    c.feed_all(CLIENT, &client.seal(&service(MSG_SERVICE_REQUEST)))?;

    let second = Handshake::new("aes128-ctr", "hmac-sha2-256", 0xa0)?;
    c.keylog.insert(second.server_cookie, second.server.0.clone());
    c.feed_all(CLIENT, &client.seal(&second.client_kexinit))?;
    c.feed_all(SERVER, &server.seal(&second.server_kexinit))?;
    c.feed_all(CLIENT, &client.seal(&second.ecdh_init()))?;
    c.feed_all(SERVER, &server.seal(&second.ecdh_reply()))?;
    c.feed_all(SERVER, &server.seal(&[MSG_NEWKEYS]))?;
    c.feed_all(CLIENT, &client.seal(&[MSG_NEWKEYS]))?;

    let (h2, keys) = second.keys(Some(&h1))?;
    assert_ne!(h1, h2);
    assert_eq!(c.session.session_id(), Some(&h1[..]));
    assert_eq!(c.session.exchange_hash(), Some(&h2[..]));

    let mut client = CtrSealer::new(&keys, CLIENT, client.sequence_number)?;
    let ignore = message(MSG_IGNORE, |p| put_string(p, b"after rekey"));
    c.feed_all(CLIENT, &client.seal(&ignore))?;

    assert!(c.sink.diagnostics.is_empty(), "{:?}", c.sink.diagnostics);
    let data = c
        .sink
        .find(Field::IgnoreData)
        .ok_or_else(|| anyhow!("IGNORE not decrypted"))?;
    assert_eq!(data.value, OwnedValue::Bytes(b"after rekey".to_vec()));
    assert_eq!(c.session.peer(CLIENT).sequence_number(), 8);
    Ok(())
}

#[test]
fn unknown_key_leaves_records_opaque() -> Result<()> {
    let hs = Handshake::new("aes128-ctr", "hmac-sha2-256", 0xc0)?;
    let mut c = Capture::new();
    c.handshake(&hs)?;

    assert!(c.session.session_id().is_none());
    assert!(c.session.peer(CLIENT).is_opaque());

    let (_, keys) = hs.keys(None)?;
    let record = CtrSealer::new(&keys, CLIENT, 3)?.seal(&service(MSG_SERVICE_REQUEST));
    c.feed_all(CLIENT, &record)?;

    assert!(c.sink.plaintexts.is_empty());
    assert!(c.sink.find(Field::ServiceName).is_none());
    let encrypted = c
        .sink
        .all(Field::EncryptedPacket)
        .last()
        .ok_or_else(|| anyhow!("no opaque record"))?;
    assert_eq!(encrypted.span.offset, 4);
    assert_eq!(encrypted.span.len, record.len() - 4 - 32);
    Ok(())
}

#[test]
fn group_exchange_session_is_decrypted() -> Result<()> {
    // 2^64 - 59 is prime; its mpint and f's both carry a leading zero byte
    let p = BigUint::from(0xffff_ffff_ffff_ffc5u64);

    for &old in &[false, true] {
        let dh = DhExchange::new(
            "diffie-hellman-group-exchange-sha256",
            "aes128-ctr",
            "hmac-sha2-256",
            p.clone(),
            0x30,
        );
        assert_eq!(dh.f().len(), 8);
        assert!(dh.f()[0] & 0x80 != 0);

        let mut group_fields = vec![];
        let request = if old {
            group_fields.extend_from_slice(&2048u32.to_be_bytes());
            message(MSG_KEX_DH_GEX_REQUEST_OLD, |b| b.extend_from_slice(&group_fields))
        } else {
            for bound in &[1024u32, 2048, 8192] {
                group_fields.extend_from_slice(&bound.to_be_bytes());
            }
            message(MSG_KEX_DH_GEX_REQUEST, |b| b.extend_from_slice(&group_fields))
        };
        put_mpint(&mut group_fields, &dh.p.to_bytes_be());
        put_mpint(&mut group_fields, &dh.g.to_bytes_be());

        let mut c = Capture::new();
        c.keylog
            .insert(dh.server_cookie, KeyMaterial::new(dh.y.to_bytes_be()));
        c.banners(&dh.client_kexinit, &dh.server_kexinit)?;
        c.feed_all(CLIENT, &packet(&request, 8))?;
        c.feed_all(SERVER, &packet(&dh.group(), 8))?;
        c.feed_all(CLIENT, &packet(&dh.init(MSG_KEX_DH_GEX_INIT), 8))?;
        let mut reply = packet(&dh.reply(MSG_KEX_DH_GEX_REPLY), 8);
        reply.extend_from_slice(&packet(&[MSG_NEWKEYS], 8));
        c.feed_all(SERVER, &reply)?;
        c.feed_all(CLIENT, &packet(&[MSG_NEWKEYS], 8))?;

        let (h, keys) = dh.keys(&group_fields);
        assert_eq!(c.session.exchange_hash(), Some(&h[..]));
        assert_eq!(c.session.session_id(), Some(&h[..]));
        assert_eq!(
            c.session.shared_secret().map(|k| k.as_bytes()),
            Some(&dh.k()[..])
        );
        assert_eq!(c.sink.find(Field::GexMin).is_some(), !old);
        assert!(c.sink.find(Field::GexPreferred).is_some());

        let mut client = CtrSealer::new(&keys, CLIENT, 4)?;
        c.feed_all(CLIENT, &client.seal(&service(MSG_SERVICE_REQUEST)))?;
        assert!(c.sink.diagnostics.is_empty(), "{:?}", c.sink.diagnostics);
        assert_eq!(c.texts(Field::ServiceName), ["ssh-userauth"]);
    }
    Ok(())
}

#[test]
fn classic_dh_session_is_decrypted() -> Result<()> {
    let p = BigUint::from_bytes_be(&hex::decode(MODP_2048)?);
    let dh = DhExchange::new(
        "diffie-hellman-group14-sha256",
        "aes128-ctr",
        "hmac-sha2-256",
        p,
        0x50,
    );
    let mut c = Capture::new();
    // only the client's exponent is known, so K comes from f
    c.keylog
        .insert(dh.client_cookie, KeyMaterial::new(dh.x.to_bytes_be()));
    c.banners(&dh.client_kexinit, &dh.server_kexinit)?;
    c.feed_all(CLIENT, &packet(&dh.init(MSG_KEXDH_INIT), 8))?;
    let mut reply = packet(&dh.reply(MSG_KEXDH_REPLY), 8);
    reply.extend_from_slice(&packet(&[MSG_NEWKEYS], 8));
    c.feed_all(SERVER, &reply)?;
    c.feed_all(CLIENT, &packet(&[MSG_NEWKEYS], 8))?;

    let (h, keys) = dh.keys(&[]);
    assert_eq!(c.session.session_id(), Some(&h[..]));
    assert_eq!(
        c.session.shared_secret().map(|k| k.as_bytes()),
        Some(&dh.k()[..])
    );
    let f = c.sink.find(Field::DhF).ok_or_else(|| anyhow!("no f"))?;
    assert_eq!(f.value, OwnedValue::Bytes([&[0u8][..], &dh.f()].concat()));

    let mut client = CtrSealer::new(&keys, CLIENT, 3)?;
    let mut server = CtrSealer::new(&keys, SERVER, 3)?;
    c.feed_all(CLIENT, &client.seal(&service(MSG_SERVICE_REQUEST)))?;
    c.feed_all(SERVER, &server.seal(&service(MSG_SERVICE_ACCEPT)))?;

    assert!(c.sink.diagnostics.is_empty(), "{:?}", c.sink.diagnostics);
    assert_eq!(c.texts(Field::ServiceName), ["ssh-userauth", "ssh-userauth"]);
    Ok(())
}

#[test]
fn aes_gcm_records_in_sequence() -> Result<()> {
    let hs = Handshake::new("aes128-gcm@openssh.com", "hmac-sha2-256", 0xe0)?;
    let mut c = Capture::new();
    c.keylog.insert(hs.server_cookie, hs.server.0.clone());
    c.handshake(&hs)?;

    let (_, keys) = hs.keys(None)?;
    let mut client = GcmSealer::new(&keys, CLIENT)?;
    let mut server = GcmSealer::new(&keys, SERVER)?;

    // the clear length is not complete yet
    let first = client.seal(&service(MSG_SERVICE_REQUEST))?;
    assert_eq!(
        c.feed(CLIENT, &first[..3]),
        Progress::NeedMore {
            resume_offset: 0,
            hint: None
        }
    );
    let second = client.seal(&password_request("alice", "hunter2"))?;
    c.feed_all(CLIENT, &[first, second].concat())?;
    c.feed_all(SERVER, &server.seal(&service(MSG_SERVICE_ACCEPT))?)?;

    // a bad tag is reported but the record is still dissected
    let mut tampered = server.seal(&[MSG_USERAUTH_SUCCESS])?;
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    c.feed_all(SERVER, &tampered)?;

    assert_eq!(
        c.texts(Field::ServiceName),
        ["ssh-userauth", "ssh-userauth", "ssh-connection"]
    );
    let password = c
        .sink
        .find(Field::Password)
        .ok_or_else(|| anyhow!("no password"))?;
    assert_eq!(
        password.span.source,
        Source::Decrypted {
            direction: CLIENT,
            sequence_number: 4
        }
    );
    let diagnostics: Vec<_> = c.sink.diagnostics.iter().map(|(_, d)| *d).collect();
    assert_eq!(
        diagnostics,
        [Diagnostic::MacMismatch {
            sequence_number: 4
        }]
    );
    assert_eq!(
        c.sink.plaintexts.last(),
        Some(&(SERVER, 4, padded(&[MSG_USERAUTH_SUCCESS], 16, 0)))
    );

    // host key and signature blobs of the reply
    assert_eq!(c.texts(Field::HostKeyType), ["ssh-ed25519"]);
    assert_eq!(c.texts(Field::SignatureType), ["ssh-ed25519"]);
    Ok(())
}

#[test]
fn unknown_key_shows_clear_gcm_length() -> Result<()> {
    let hs = Handshake::new("aes128-gcm@openssh.com", "hmac-sha2-256", 0xf0)?;
    let mut c = Capture::new();
    c.handshake(&hs)?;
    assert!(c.session.peer(SERVER).is_opaque());

    let (_, keys) = hs.keys(None)?;
    let record = GcmSealer::new(&keys, SERVER)?.seal(&service(MSG_SERVICE_ACCEPT))?;
    c.feed_all(SERVER, &record)?;

    assert!(c.sink.plaintexts.is_empty());
    let length = c
        .sink
        .all(Field::PacketLength)
        .last()
        .ok_or_else(|| anyhow!("no packet length"))?;
    assert_eq!(length.span.offset, 0);
    assert_eq!(length.value, OwnedValue::Uint(record.len() as u64 - 4 - 16));
    let tag = c
        .sink
        .all(Field::Mac)
        .last()
        .ok_or_else(|| anyhow!("no tag"))?;
    assert_eq!(tag.span.len, 16);
    Ok(())
}
