//! A small line-oriented harness exercising the engine end-to-end through
//! the wire codec. Not a network listener.

use shardcache::codec::{Header, Opcode, Status, HEADER_LEN};
use shardcache::{Engine, EngineConfig, StoreOp, StoreReq};
use tracing_subscriber::EnvFilter;

fn encode_set_request(key: &[u8], value: &[u8]) -> Vec<u8> {
    let header = Header::request(Opcode::Set, key.len() as u16, 0, (key.len() + value.len()) as u32, 0);
    let mut buf = header.encode().to_vec();
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

fn run_request(engine: &Engine, buf: &[u8]) -> (Header, Vec<u8>) {
    let header_bytes: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().unwrap();
    let header = Header::decode(&header_bytes).expect("valid header");
    let key_len = header.key_len as usize;
    let key = &buf[HEADER_LEN..HEADER_LEN + key_len];
    let value = &buf[HEADER_LEN + key_len..];

    match Opcode::from_u8(header.opcode) {
        Some(Opcode::Set) => {
            match engine.store(
                StoreOp::Set,
                StoreReq {
                    key,
                    value,
                    flags: 0,
                    exptime: 0,
                    cas: 0,
                },
            ) {
                Ok(cas) => (
                    Header::response(Opcode::Set, Status::Success, 0, cas),
                    Vec::new(),
                ),
                Err(e) => (
                    Header::response(Opcode::Set, Status::from(&e), 0, 0),
                    Vec::new(),
                ),
            }
        }
        Some(Opcode::Get) => match engine.get(key) {
            Ok(info) => (
                Header::response(Opcode::Get, Status::Success, info.value.len() as u32, info.cas),
                info.value,
            ),
            Err(e) => (
                Header::response(Opcode::Get, Status::from(&e), 0, 0),
                Vec::new(),
            ),
        },
        _ => (
            Header::response(Opcode::Get, Status::UnknownCommand, 0, 0),
            Vec::new(),
        ),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let engine = Engine::new(EngineConfig::from_env());

    let set_req = encode_set_request(b"greeting", b"hello, shardcache");
    let (header, _) = run_request(&engine, &set_req);
    println!("SET status={:?} cas={}", header.status_or_reserved, header.cas);

    let get_req = {
        let header = Header::request(Opcode::Get, 8, 0, 8, 0);
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(b"greeting");
        buf
    };
    let (header, body) = run_request(&engine, &get_req);
    println!(
        "GET status={:?} value={:?}",
        header.status_or_reserved,
        String::from_utf8_lossy(&body)
    );

    let snapshot = engine.get_stats();
    println!("stats: {snapshot:?}");

    engine.shutdown();
}
