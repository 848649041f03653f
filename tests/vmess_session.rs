//! Integration tests for the VMess server session: header decode/encode,
//! replay defense, and body pipeline selection, end to end over
//! `tokio::io::duplex` pairs.

use openworld::vmess::cfb::CfbEncryptWriter;
use openworld::vmess::protocol::{fnv1a_hash, header_iv};
use openworld::vmess::session::{select_body_reader, select_body_writer};
use openworld::vmess::{
    Command, DestAddress, RequestOptions, ServerSession, SessionHistory, StaticUserDirectory,
    VmessError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const USER: [u8; 16] = [0x01; 16];
const CMD_KEY: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
];
const TIMESTAMP: u64 = 1;

struct HeaderSpec<'a> {
    body_key: [u8; 16],
    body_iv: [u8; 16],
    response_byte: u8,
    option: u8,
    security_nibble: u8,
    pad_len: u8,
    command: u8,
    port: u16,
    addr_type: u8,
    addr_bytes: &'a [u8],
}

/// A minimal client-side encoder, used only by tests to build wire-valid
/// request headers — the production client session is out of scope.
fn encode_request_header(spec: &HeaderSpec) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(64);
    plaintext.push(1); // version
    plaintext.extend_from_slice(&spec.body_iv);
    plaintext.extend_from_slice(&spec.body_key);
    plaintext.push(spec.response_byte);
    plaintext.push(spec.option);
    plaintext.push((spec.pad_len << 4) | spec.security_nibble);
    plaintext.push(0); // reserved
    plaintext.push(spec.command);
    plaintext.extend_from_slice(&spec.port.to_be_bytes());
    plaintext.push(spec.addr_type);
    plaintext.extend_from_slice(spec.addr_bytes);

    let padding = vec![0xAAu8; spec.pad_len as usize];
    plaintext.extend_from_slice(&padding);

    let checksum = fnv1a_hash(&plaintext);
    plaintext.extend_from_slice(&checksum.to_be_bytes());

    let iv = header_iv(TIMESTAMP);
    let mut wire = Vec::with_capacity(16 + plaintext.len());
    wire.extend_from_slice(&USER);

    // Encrypt everything after the auth token with AES-128-CFB(cmd_key, iv).
    let mut buf = plaintext.clone();
    {
        use aes_gcm::aes::Aes128;
        use cfb_mode::BufEncryptor;
        use cipher::KeyIvInit;
        let mut enc = BufEncryptor::<Aes128>::new_from_slices(&CMD_KEY, &iv).unwrap();
        enc.encrypt(&mut buf);
    }
    wire.extend_from_slice(&buf);
    wire
}

fn directory() -> StaticUserDirectory {
    StaticUserDirectory::new(TIMESTAMP).with_user(USER, CMD_KEY)
}

#[tokio::test]
async fn s1_full_handshake_round_trip() {
    let dir = directory();
    let history = SessionHistory::new(CancellationToken::new());
    let mut session = ServerSession::new(&dir, history.clone());

    let body_key: [u8; 16] = core::array::from_fn(|i| 0x10 + i as u8);
    let body_iv: [u8; 16] = core::array::from_fn(|i| 0x20 + i as u8);

    let wire = encode_request_header(&HeaderSpec {
        body_key,
        body_iv,
        response_byte: 0x37,
        option: 0x05, // ChunkStream | ChunkMasking
        security_nibble: 0x03, // AES128_GCM
        pad_len: 3,
        command: 0x01, // TCP
        port: 443,
        addr_type: 0x01, // IPv4
        addr_bytes: &[93, 184, 216, 34],
    });

    let (mut client, server) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        client.write_all(&wire).await.unwrap();
        client.flush().await.unwrap();
        // Keep the client half alive until the assertions below complete.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    });

    let (descriptor, _reader) = session.decode_request_header(server).await.unwrap();

    assert_eq!(descriptor.command, Command::Tcp);
    assert_eq!(descriptor.port, 443);
    assert_eq!(descriptor.address, DestAddress::V4([93, 184, 216, 34]));
    assert!(descriptor.options.has_chunk_stream());
    assert!(descriptor.options.has_chunk_masking());

    let fingerprint = openworld::vmess::SessionFingerprint {
        user: USER,
        key: body_key,
        nonce: body_iv,
    };
    assert!(history.has(&fingerprint).await);
}

#[tokio::test]
async fn s2_zero_length_domain_rejected() {
    let dir = directory();
    let history = SessionHistory::new(CancellationToken::new());
    let mut session = ServerSession::new(&dir, history);

    let body_key: [u8; 16] = core::array::from_fn(|i| 0x10 + i as u8);
    let body_iv: [u8; 16] = core::array::from_fn(|i| 0x20 + i as u8);

    let wire = encode_request_header(&HeaderSpec {
        body_key,
        body_iv,
        response_byte: 0x37,
        option: 0x05,
        security_nibble: 0x03,
        pad_len: 3,
        command: 0x01,
        port: 443,
        addr_type: 0x02, // Domain
        addr_bytes: &[0], // L == 0
    });

    let (mut client, server) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        client.write_all(&wire).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    });

    let err = session.decode_request_header(server).await.unwrap_err();
    assert!(matches!(err, VmessError::ZeroLengthDomain));
}

#[tokio::test]
async fn s3_immediate_replay_rejected() {
    let dir = directory();
    let history = SessionHistory::new(CancellationToken::new());

    let body_key: [u8; 16] = core::array::from_fn(|i| 0x11 + i as u8);
    let body_iv: [u8; 16] = core::array::from_fn(|i| 0x21 + i as u8);
    let make_wire = || {
        encode_request_header(&HeaderSpec {
            body_key,
            body_iv,
            response_byte: 0x01,
            option: 0x00,
            security_nibble: 0x05, // NONE
            pad_len: 0,
            command: 0x01,
            port: 80,
            addr_type: 0x01,
            addr_bytes: &[1, 1, 1, 1],
        })
    };

    {
        let mut session = ServerSession::new(&dir, history.clone());
        let (mut client, server) = tokio::io::duplex(4096);
        let wire = make_wire();
        tokio::spawn(async move {
            client.write_all(&wire).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });
        session.decode_request_header(server).await.unwrap();
    }

    {
        let mut session = ServerSession::new(&dir, history);
        let (mut client, server) = tokio::io::duplex(4096);
        let wire = make_wire();
        tokio::spawn(async move {
            client.write_all(&wire).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });
        let err = session.decode_request_header(server).await.unwrap_err();
        assert!(matches!(err, VmessError::Replay));
    }
}

#[tokio::test]
async fn s4_checksum_tamper_rejected_and_fingerprint_not_retained() {
    let dir = directory();
    let history = SessionHistory::new(CancellationToken::new());
    let mut session = ServerSession::new(&dir, history.clone());

    let body_key: [u8; 16] = core::array::from_fn(|i| 0x12 + i as u8);
    let body_iv: [u8; 16] = core::array::from_fn(|i| 0x22 + i as u8);
    let mut wire = encode_request_header(&HeaderSpec {
        body_key,
        body_iv,
        response_byte: 0x01,
        option: 0x00,
        security_nibble: 0x05,
        pad_len: 0,
        command: 0x01,
        port: 80,
        addr_type: 0x01,
        addr_bytes: &[2, 2, 2, 2],
    });
    *wire.last_mut().unwrap() ^= 0xFF;

    let (mut client, server) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        client.write_all(&wire).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    });

    let err = session.decode_request_header(server).await.unwrap_err();
    assert!(matches!(err, VmessError::InvalidAuth));

    let fingerprint = openworld::vmess::SessionFingerprint {
        user: USER,
        key: body_key,
        nonce: body_iv,
    };
    assert!(!history.has(&fingerprint).await);
}

#[tokio::test]
async fn s5_none_chunkstream_udp_three_frames() {
    use openworld::vmess::{RequestDescriptor, SecurityType, SessionCryptoState};

    let descriptor = RequestDescriptor {
        version: 1,
        user_handle: USER,
        options: RequestOptions(RequestOptions::CHUNK_STREAM),
        security: SecurityType::None,
        command: Command::Udp,
        port: 53,
        address: DestAddress::V4([8, 8, 8, 8]),
    };
    let crypto = SessionCryptoState {
        request_body_key: [0u8; 16],
        request_body_iv: [0u8; 16],
        response_header_byte: 0,
    };

    let (client, server) = tokio::io::duplex(4096);
    let mut writer = select_body_writer(&descriptor, &crypto.request_body_key, &crypto.request_body_iv, client);
    let mut reader = select_body_reader(&descriptor, &crypto, server);

    let frames: [&[u8]; 3] = [b"a", b"bb", b"ccc"];
    for frame in frames {
        writer.write_all(frame).await.unwrap();
    }
    writer.flush().await.unwrap();
    drop(writer);

    for frame in frames {
        let mut buf = vec![0u8; frame.len()];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, frame);
    }

    let mut tail = [0u8; 1];
    let n = reader.read(&mut tail).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn s6_chacha_masking_one_large_chunk() {
    use openworld::vmess::{RequestDescriptor, SecurityType, SessionCryptoState};

    let descriptor = RequestDescriptor {
        version: 1,
        user_handle: USER,
        options: RequestOptions(RequestOptions::CHUNK_MASKING),
        security: SecurityType::Chacha20Poly1305,
        command: Command::Tcp,
        port: 443,
        address: DestAddress::V4([1, 2, 3, 4]),
    };
    let crypto = SessionCryptoState {
        request_body_key: [0x09u8; 16],
        request_body_iv: [0x0Au8; 16],
        response_header_byte: 0,
    };

    let (client, server) = tokio::io::duplex(1 << 17);
    let mut writer = select_body_writer(&descriptor, &crypto.request_body_key, &crypto.request_body_iv, client);
    let mut reader = select_body_reader(&descriptor, &crypto, server);

    let payload = vec![0x5Au8; 65535];
    writer.write_all(&payload).await.unwrap();
    writer.flush().await.unwrap();

    let mut got = vec![0u8; payload.len()];
    reader.read_exact(&mut got).await.unwrap();
    assert_eq!(got, payload);
}

#[tokio::test]
async fn response_header_round_trip_with_command_marshal_failure() {
    use openworld::vmess::ResponseDescriptor;

    let dir = directory();
    let history = SessionHistory::new(CancellationToken::new());
    let mut session = ServerSession::new(&dir, history);

    let body_key: [u8; 16] = core::array::from_fn(|i| 0x13 + i as u8);
    let body_iv: [u8; 16] = core::array::from_fn(|i| 0x23 + i as u8);
    let wire = encode_request_header(&HeaderSpec {
        body_key,
        body_iv,
        response_byte: 0x99,
        option: 0x00,
        security_nibble: 0x05,
        pad_len: 0,
        command: 0x01,
        port: 80,
        addr_type: 0x01,
        addr_bytes: &[3, 3, 3, 3],
    });

    let (mut client, server) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        client.write_all(&wire).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    });
    session.decode_request_header(server).await.unwrap();

    let (out_client, mut out_server) = tokio::io::duplex(4096);
    let response = ResponseDescriptor::new(0x00);
    let _writer: CfbEncryptWriter<_> = session
        .encode_response_header(out_client, &response)
        .await
        .unwrap();

    let mut echoed = [0u8; 4];
    out_server.read_exact(&mut echoed).await.unwrap();

    // Decrypt what was written and check the header byte was echoed and the
    // failed/absent command produced two zero bytes.
    let (response_key, response_iv) = openworld::vmess::protocol::derive_response_key_iv(&body_key, &body_iv);
    use aes_gcm::aes::Aes128;
    use cfb_mode::BufDecryptor;
    use cipher::KeyIvInit;
    let mut dec = BufDecryptor::<Aes128>::new_from_slices(&response_key, &response_iv).unwrap();
    dec.decrypt(&mut echoed);

    assert_eq!(echoed[0], 0x99);
    assert_eq!(echoed[1], 0x00);
    assert_eq!(&echoed[2..4], &[0, 0]);
}
