//! Packet analyzers, builders, and rewriters (spec C3).
//!
//! Every recognized packet type gets a parser decoding its body into a
//! record, and/or a builder serializing a record back to a body. The two
//! rewriters (106, 115) stream-copy a packet and substitute specific
//! fields without fully decoding the rest of the body.
//!
//! Individual field reads whose original (Go) implementation ignores the
//! error are implemented here with `.unwrap_or_default()`: a short read
//! yields a zero-valued field and the analyzer keeps going, rather than
//! aborting. Only the explicit schema check on packet 106 (`flag < 2`)
//! produces a hard `ProxyError::Parse`. See `codec::io` module docs.

use std::io::Cursor;

use sha2::{Digest, Sha256};

use crate::codec::{gzip_deflate, GameReader, GameWriter, Packet};
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;

fn reader_over(body: &[u8]) -> GameReader<Cursor<&[u8]>> {
    GameReader::new(Cursor::new(body))
}

// ---------------------------------------------------------------- 160 ----

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientHello {
    pub packet_version: i32,
    pub client_version: i32,
    pub query: Option<String>,
    pub player_name: String,
}

pub fn analyze_160(packet: &Packet) -> ClientHello {
    let mut r = reader_over(&packet.body);
    let _header = r.read_string().unwrap_or_default();
    let packet_version = r.read_i32().unwrap_or_default();
    let client_version = r.read_i32().unwrap_or_default();

    let mut query = None;
    let mut player_name = String::new();

    if packet_version >= 1 {
        let _ = r.skip(4);
    }
    if packet_version >= 2 {
        query = r.read_optional_string().unwrap_or_default();
    }
    if packet_version >= 3 {
        player_name = r.read_string().unwrap_or_default();
    }

    ClientHello {
        packet_version,
        client_version,
        query,
        player_name,
    }
}

// ---------------------------------------------------------------- 161 ----

pub fn build_161() -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_string("kim.der.ironcore.server.shadow").unwrap();
    w.write_i32(1).unwrap();
    w.write_i32(55).unwrap();
    w.write_i32(0).unwrap();
    w.write_string("com.corrodinggames.rts.server").unwrap();
    w.write_string("IronCore-Shadow-SERVER").unwrap();
    w.write_i32(0).unwrap();
    Packet::new(PKT_SERVER_HELLO_REPLY, w.into_inner())
}

// ---------------------------------------------------------------- 110 ----

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Login {
    pub ck_name: String,
    pub client_ver: i32,
    pub version_a: i32,
    pub version_b: i32,
    pub name: String,
    pub passwd_hex: Option<String>,
    pub ck_name2: String,
    pub player_hex: String,
    pub unit_checksum: i32,
    pub ka: String,
    pub kb: String,
}

pub fn analyze_110(packet: &Packet) -> Login {
    let mut r = reader_over(&packet.body);
    let ck_name = r.read_string().unwrap_or_default();
    let client_ver = r.read_i32().unwrap_or_default();
    let version_a = r.read_i32().unwrap_or_default();
    let version_b = r.read_i32().unwrap_or_default();
    let name = r.read_string().unwrap_or_default();
    let passwd_hex = r.read_optional_string().unwrap_or_default();
    let ck_name2 = r.read_string().unwrap_or_default();
    let player_hex = r.read_string().unwrap_or_default();
    let unit_checksum = r.read_i32().unwrap_or_default();
    let ka = r.read_string().unwrap_or_default();

    let kb = if client_ver >= 5 {
        r.read_string().unwrap_or_default()
    } else {
        String::new()
    };

    Login {
        ck_name,
        client_ver,
        version_a,
        version_b,
        name,
        passwd_hex,
        ck_name2,
        player_hex,
        unit_checksum,
        ka,
        kb,
    }
}

pub fn build_110(data: &Login) -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_string(&data.ck_name).unwrap();
    w.write_i32(data.client_ver).unwrap();
    w.write_i32(data.version_a).unwrap();
    w.write_i32(data.version_b).unwrap();
    w.write_string(&data.name).unwrap();
    w.write_optional_string(data.passwd_hex.as_deref()).unwrap();
    w.write_string(&data.ck_name2).unwrap();
    w.write_string(&data.player_hex).unwrap();
    w.write_i32(data.unit_checksum).unwrap();
    w.write_string(&data.ka).unwrap();
    if data.client_ver >= 5 {
        w.write_string(&data.kb).unwrap();
    }
    Packet::new(PKT_LOGIN, w.into_inner())
}

/// `playerHex = upper(hex(sha256(utf8(name))))`. Returns the rebuilt packet
/// and the (old, new) hex values for bookkeeping on the connection.
pub fn substitute_player_hex(packet: &Packet) -> (Packet, String, String) {
    let mut login = analyze_110(packet);
    let old_hex = login.player_hex.clone();
    let digest = Sha256::digest(login.name.as_bytes());
    let new_hex = hex::encode_upper(digest);
    login.player_hex = new_hex.clone();
    (build_110(&login), old_hex, new_hex)
}

// ---------------------------------------------------------------- 106 ----

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapInfo {
    pub first_string: String,
    pub first_int: i32,
    pub map_type: i32,
    pub map_name: String,
    pub credits: i32,
    pub fog: i32,
    pub revealed_map: bool,
    pub ai_difficulty: i32,
    pub init_units: i32,
    pub income: f32,
    pub nukes: bool,
}

pub fn analyze_106(packet: &Packet) -> Result<MapInfo> {
    let mut r = reader_over(&packet.body);
    let first_string = r.read_string().unwrap_or_default();
    let first_int = r.read_i32().unwrap_or_default();
    let map_type = r.read_i32().unwrap_or_default();
    let map_name = r.read_string().unwrap_or_default();
    let credits = r.read_i32().unwrap_or_default();
    let fog = r.read_i32().unwrap_or_default();
    let revealed_map = r.read_bool().unwrap_or_default();
    let ai_difficulty = r.read_i32().unwrap_or_default();
    let flag = r.read_u8().unwrap_or_default();
    let _ = r.skip(2);
    if flag >= 1 {
        let _ = r.skip(8);
    }
    if flag < 2 {
        return Err(ProxyError::parse(PKT_MAP_INFO, "flag byte must be >= 2"));
    }
    let init_units = r.read_i32().unwrap_or_default();
    let income = r.read_f32().unwrap_or_default();
    let nukes = r.read_bool().unwrap_or_default();

    Ok(MapInfo {
        first_string,
        first_int,
        map_type,
        map_name,
        credits,
        fog,
        revealed_map,
        ai_difficulty,
        init_units,
        income,
        nukes,
    })
}

/// Copy every field of a 106 body through to a fresh body, replacing `fog`
/// with 0. Preserves the conditional 8-byte skip region and whatever
/// trailing bytes follow, byte for byte.
pub fn rewrite_106_fog(packet: &Packet) -> Result<Packet> {
    let mut r = reader_over(&packet.body);
    let mut w = GameWriter::new(Vec::new());

    let first_string = r.read_string().unwrap_or_default();
    w.write_string(&first_string)?;

    let first_int = r.read_i32().unwrap_or_default();
    w.write_i32(first_int)?;

    let map_type = r.read_i32().unwrap_or_default();
    w.write_i32(map_type)?;

    let map_name = r.read_string().unwrap_or_default();
    w.write_string(&map_name)?;

    let credits = r.read_i32().unwrap_or_default();
    w.write_i32(credits)?;

    let _fog = r.read_i32().unwrap_or_default();
    w.write_i32(0)?;

    let revealed_map = r.read_bool().unwrap_or_default();
    w.write_bool(revealed_map)?;

    let ai_difficulty = r.read_i32().unwrap_or_default();
    w.write_i32(ai_difficulty)?;

    let flag = r.read_u8().unwrap_or_default();
    w.write_u8(flag)?;

    let mut reserved = Vec::new();
    r.transfer_fixed(&mut reserved, 2)?;
    w.write_bytes(&reserved)?;

    if flag >= 1 {
        let mut custom = Vec::new();
        r.transfer_fixed(&mut custom, 8)?;
        w.write_bytes(&custom)?;
    }

    let mut tail = Vec::new();
    r.transfer_all(&mut tail)?;
    w.write_bytes(&tail)?;

    Ok(Packet::new(PKT_MAP_INFO, w.into_inner()))
}

// ------------------------------------------------------------ 108/109 ----

pub fn analyze_108(packet: &Packet) -> i64 {
    let mut r = reader_over(&packet.body);
    r.read_i64().unwrap_or_default()
}

pub fn build_108() -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_i64(0).unwrap();
    w.write_u8(0).unwrap();
    Packet::new(PKT_PING_REQUEST, w.into_inner())
}

pub fn build_109(send_time: i64) -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_i64(send_time).unwrap();
    w.write_u8(0).unwrap();
    Packet::new(PKT_PING_REPLY, w.into_inner())
}

// ---------------------------------------------------------------- 117 ----

pub fn build_117(msg: &str) -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_u8(1).unwrap();
    w.write_i32(5).unwrap();
    w.write_string(msg).unwrap();
    Packet::new(PKT_CHAT_SYSTEM_PROMPT, w.into_inner())
}

// ---------------------------------------------------------------- 118 ----

pub fn analyze_118(packet: &Packet) -> String {
    let mut r = reader_over(&packet.body);
    let _ = r.skip(5);
    let msg = r.read_string().unwrap_or_default();
    msg.trim().to_string()
}

// ---------------------------------------------------------------- 140 ----

pub fn analyze_140(packet: &Packet) -> String {
    let mut r = reader_over(&packet.body);
    r.read_string().unwrap_or_default()
}

// ---------------------------------------------------------------- 141 ----

pub fn build_141(msg: &str, sender: Option<&str>, team: i32) -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_string(msg).unwrap();
    w.write_u8(3).unwrap();
    w.write_optional_string(sender).unwrap();
    w.write_i32(team).unwrap();
    w.write_i32(team).unwrap();
    Packet::new(PKT_CHAT_BROADCAST, w.into_inner())
}

pub fn build_141_system(msg: &str) -> Packet {
    build_141(msg, Some("SERVER"), 5)
}

// ---------------------------------------------------------------- 115 ----

/// Build a fresh 115 (player list) from a list of currently connected
/// player names, padding with empty slots up to `MAX_PLAYER_LIST_SLOTS`.
/// Unlike an inbound 115 (see `rewrite_115_fog`), the slot block here is
/// written raw, with no length prefix and no gzip framing around it.
pub fn build_115(player_names: &[String], excluding: Option<&str>) -> Result<Packet> {
    let mut slots = GameWriter::new(Vec::new());
    let mut player_size = 0usize;

    for (idx, name) in player_names.iter().take(MAX_PLAYER_LIST_SLOTS).enumerate() {
        if Some(name.as_str()) != excluding {
            player_size += 1;
        }
        slots.write_bool(true)?;
        slots.write_i32(0)?;
        slots.write_u8(idx as u8)?;
        slots.write_i32(0)?;
        slots.write_i32(0)?;
        slots.write_optional_string(Some(name))?;
        slots.write_bool(false)?;
        slots.write_i32(1)?;
        slots.write_i64(0)?;
        slots.write_bool(false)?;
        slots.write_i32(0)?;
    }
    let filled = player_names.len().min(MAX_PLAYER_LIST_SLOTS);
    for _ in filled..MAX_PLAYER_LIST_SLOTS {
        slots.write_bool(false)?;
    }

    let mut w = GameWriter::new(Vec::new());
    w.write_i32(player_size as i32)?;
    w.write_bytes(&slots.into_inner())?;
    w.write_i32(2)?;
    w.write_i32(0)?;
    w.write_bool(true)?;
    w.write_i32(1)?;
    w.write_u8(0)?;
    w.write_i32(0)?;
    w.write_i32(0)?;

    Ok(Packet::new(PKT_PLAYER_LIST, w.into_inner()))
}

/// Rewrite an inbound 115 from the real target: copy `playerSize`,
/// `relayCustomMaxPlayer`, `maxPlayerSize`, `head`, `gzipBlockLength`, then
/// byte-copy exactly `gzipBlockLength` bytes without touching the gzip
/// block itself, then zero the trailing `i32` and copy the remainder.
pub fn rewrite_115_fog(packet: &Packet) -> Result<Packet> {
    let mut r = reader_over(&packet.body);
    let mut w = GameWriter::new(Vec::new());

    let player_size = r.read_i32().unwrap_or_default();
    w.write_i32(player_size)?;

    let relay_custom_max_player = r.read_bool().unwrap_or_default();
    w.write_bool(relay_custom_max_player)?;

    let max_player_size = r.read_i32().unwrap_or_default();
    w.write_i32(max_player_size)?;

    let head = r.read_string().unwrap_or_default();
    w.write_string(&head)?;

    let gzip_block_len = r.read_i32().unwrap_or_default();
    w.write_i32(gzip_block_len)?;

    let mut gzip_block = Vec::new();
    r.transfer_fixed(&mut gzip_block, gzip_block_len.max(0) as usize)?;
    w.write_bytes(&gzip_block)?;

    let _trailing = r.read_i32().unwrap_or_default();
    w.write_i32(0)?;

    let mut tail = Vec::new();
    r.transfer_all(&mut tail)?;
    w.write_bytes(&tail)?;

    Ok(Packet::new(PKT_PLAYER_LIST, w.into_inner()))
}

// ---------------------------------------------------------------- 178 ----

pub fn build_178(ip: &str) -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_u8(0).unwrap();
    w.write_i32(3).unwrap();
    w.write_bool(false).unwrap();
    w.write_i32(1).unwrap();
    w.write_string(ip).unwrap();
    Packet::new(PKT_SERVER_REDIRECT, w.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_160_roundtrip_versions() {
        let mut w = GameWriter::new(Vec::new());
        w.write_string("x").unwrap();
        w.write_i32(3).unwrap();
        w.write_i32(7).unwrap();
        w.write_bytes(&[0, 0, 0, 0]).unwrap(); // version>=1 skip(4)
        w.write_optional_string(Some("q")).unwrap(); // version>=2
        w.write_string("P").unwrap(); // version>=3
        let packet = Packet::new(PKT_CLIENT_HELLO, w.into_inner());

        let hello = analyze_160(&packet);
        assert_eq!(hello.client_version, 7);
        assert_eq!(hello.query, Some("q".to_string()));
        assert_eq!(hello.player_name, "P");
    }

    #[test]
    fn hello_160_no_player_name_below_version_3() {
        let mut w = GameWriter::new(Vec::new());
        w.write_string("x").unwrap();
        w.write_i32(0).unwrap();
        w.write_i32(1).unwrap();
        let packet = Packet::new(PKT_CLIENT_HELLO, w.into_inner());
        let hello = analyze_160(&packet);
        assert_eq!(hello.player_name, "");
        assert_eq!(hello.query, None);
    }

    #[test]
    fn build_161_matches_expected_header() {
        let packet = build_161();
        let mut r = reader_over(&packet.body);
        assert_eq!(r.read_string().unwrap(), "kim.der.ironcore.server.shadow");
        assert_eq!(r.read_i32().unwrap(), 1);
        assert_eq!(r.read_i32().unwrap(), 55);
        assert_eq!(r.read_i32().unwrap(), 0);
    }

    #[test]
    fn player_hex_substitution_matches_known_vector() {
        let login = Login {
            ck_name: "ck".into(),
            client_ver: 4,
            version_a: 1,
            version_b: 1,
            name: "Alice".into(),
            passwd_hex: None,
            ck_name2: "ck2".into(),
            player_hex: "XYZ".into(),
            unit_checksum: 0,
            ka: "ka".into(),
            kb: String::new(),
        };
        let packet = build_110(&login);
        let (rebuilt, old_hex, new_hex) = substitute_player_hex(&packet);
        assert_eq!(old_hex, "XYZ");
        assert_eq!(
            new_hex,
            "3BC51062973C458D5A6F2D8D64A023246354AD7E064B1E4E009EC8A0699A3043"
        );
        let rebuilt_login = analyze_110(&rebuilt);
        assert_eq!(rebuilt_login.player_hex, new_hex);
        assert_eq!(rebuilt_login.name, "Alice");
    }

    #[test]
    fn login_110_kb_only_present_from_version_5() {
        let login = Login {
            client_ver: 5,
            kb: "kb-value".into(),
            ..Default::default()
        };
        let packet = build_110(&login);
        let decoded = analyze_110(&packet);
        assert_eq!(decoded.kb, "kb-value");

        let login_v4 = Login {
            client_ver: 4,
            kb: "should not appear".into(),
            ..Default::default()
        };
        let packet_v4 = build_110(&login_v4);
        let decoded_v4 = analyze_110(&packet_v4);
        assert_eq!(decoded_v4.kb, "");
    }

    fn sample_106_body(flag: u8, fog: i32) -> Packet {
        let mut w = GameWriter::new(Vec::new());
        w.write_string("s").unwrap();
        w.write_i32(1).unwrap();
        w.write_i32(2).unwrap();
        w.write_string("map").unwrap();
        w.write_i32(100).unwrap();
        w.write_i32(fog).unwrap();
        w.write_bool(true).unwrap();
        w.write_i32(3).unwrap();
        w.write_u8(flag).unwrap();
        w.write_bytes(&[0, 0]).unwrap();
        if flag >= 1 {
            w.write_bytes(&[0u8; 8]).unwrap();
        }
        w.write_i32(42).unwrap();
        w.write_f32(1.5).unwrap();
        w.write_bool(true).unwrap();
        Packet::new(PKT_MAP_INFO, w.into_inner())
    }

    #[test]
    fn map_info_106_fog_rewrite_zeroes_fog_only() {
        let original = sample_106_body(2, 7);
        let parsed_before = analyze_106(&original).unwrap();
        let rewritten = rewrite_106_fog(&original).unwrap();
        let parsed_after = analyze_106(&rewritten).unwrap();

        assert_eq!(parsed_after.fog, 0);
        assert_eq!(parsed_after.map_name, parsed_before.map_name);
        assert_eq!(parsed_after.credits, parsed_before.credits);
        assert_eq!(parsed_after.ai_difficulty, parsed_before.ai_difficulty);
        assert_eq!(parsed_after.init_units, parsed_before.init_units);
        assert_eq!(parsed_after.income, parsed_before.income);
        assert_eq!(parsed_after.nukes, parsed_before.nukes);
    }

    #[test]
    fn map_info_106_flag_below_2_is_parse_error() {
        let packet = sample_106_body(1, 0);
        let err = analyze_106(&packet).unwrap_err();
        assert!(matches!(err, ProxyError::Parse { packet_type: PKT_MAP_INFO, .. }));
    }

    #[test]
    fn player_list_115_fog_rewrite_preserves_gzip_block_and_tail() {
        let gzip_block = gzip_deflate(b"slots payload").unwrap();
        let mut w = GameWriter::new(Vec::new());
        w.write_i32(3).unwrap();
        w.write_bool(true).unwrap();
        w.write_i32(8).unwrap();
        w.write_string("head").unwrap();
        w.write_i32(gzip_block.len() as i32).unwrap();
        w.write_bytes(&gzip_block).unwrap();
        w.write_i32(999).unwrap();
        w.write_bytes(b"tail-bytes").unwrap();
        let original = Packet::new(PKT_PLAYER_LIST, w.into_inner());

        let rewritten = rewrite_115_fog(&original).unwrap();

        let mut r = reader_over(&rewritten.body);
        assert_eq!(r.read_i32().unwrap(), 3);
        assert_eq!(r.read_bool().unwrap(), true);
        assert_eq!(r.read_i32().unwrap(), 8);
        assert_eq!(r.read_string().unwrap(), "head");
        let len = r.read_i32().unwrap();
        assert_eq!(len as usize, gzip_block.len());
        let mut block = Vec::new();
        r.transfer_fixed(&mut block, len as usize).unwrap();
        assert_eq!(block, gzip_block);
        assert_eq!(r.read_i32().unwrap(), 0);
        let tail = r.read_to_end().unwrap();
        assert_eq!(tail, b"tail-bytes");
    }

    #[test]
    fn ping_108_109_roundtrip() {
        let ping = build_108();
        assert_eq!(analyze_108(&ping), 0);

        let pong = build_109(0x0123_4567_89AB_CDEFu64 as i64);
        assert_eq!(analyze_108(&pong), 0x0123_4567_89AB_CDEFu64 as i64);
    }

    #[test]
    fn chat_118_trims_whitespace() {
        let mut w = GameWriter::new(Vec::new());
        w.write_bytes(&[0u8; 5]).unwrap();
        w.write_string("  192.0.2.5:7000  ").unwrap();
        let packet = Packet::new(PKT_CLIENT_TEXT_INPUT, w.into_inner());
        assert_eq!(analyze_118(&packet), "192.0.2.5:7000");
    }

    #[test]
    fn build_115_pads_to_eight_slots() {
        let names = vec!["a".to_string(), "b".to_string()];
        let packet = build_115(&names, None).unwrap();
        assert_eq!(packet.kind, PKT_PLAYER_LIST);
        let mut r = reader_over(&packet.body);
        assert_eq!(r.read_i32().unwrap(), 2);
    }
}
