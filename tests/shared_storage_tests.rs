use ipnet::IpNet;
use lpmtrie::{Error, LpmTrie};
use proptest::collection::vec as pvec;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn lookup<'t>(trie: &'t LpmTrie<'_>, s: &str) -> Option<&'t [u8]> {
    trie.lookup(addr(s))
}

/// Reads header field `field` (0-based u32 index) out of a packed image.
fn header_u32(storage: &[u8], field: usize) -> u32 {
    let offset = field * 4;
    u32::from_ne_bytes(storage[offset..offset + 4].try_into().unwrap())
}

#[test]
fn pack_and_load_round_trip() {
    let mut trie = LpmTrie::new();
    trie.insert(net("192.168.1.0/24"), b"subnet1").unwrap();
    trie.insert(net("192.168.2.0/24"), b"subnet2").unwrap();
    trie.insert(net("10.0.0.0/8"), b"private").unwrap();
    trie.insert(net("2001:db8::/32"), b"ipv6-subnet").unwrap();

    let mut storage = trie.pack().unwrap();
    let loaded = LpmTrie::load(&mut storage).unwrap();

    assert_eq!(lookup(&loaded, "192.168.1.1"), Some(&b"subnet1"[..]));
    assert_eq!(lookup(&loaded, "192.168.2.100"), Some(&b"subnet2"[..]));
    assert_eq!(lookup(&loaded, "10.5.5.5"), Some(&b"private"[..]));
    assert_eq!(lookup(&loaded, "2001:db8::1"), Some(&b"ipv6-subnet"[..]));
    assert_eq!(lookup(&loaded, "8.8.8.8"), None);
}

#[test]
fn insert_after_load_extends_the_trie() {
    let mut original = LpmTrie::new();
    original.insert(net("192.168.0.0/16"), b"base").unwrap();

    let mut storage = original.pack().unwrap();
    let mut loaded = LpmTrie::load(&mut storage).unwrap();
    loaded.insert(net("10.0.0.0/8"), b"priv").unwrap();

    assert_eq!(lookup(&loaded, "192.168.1.1"), Some(&b"base"[..]));
    assert_eq!(lookup(&loaded, "10.5.5.5"), Some(&b"priv"[..]));
    assert_eq!(lookup(&loaded, "172.16.0.1"), None);
}

#[test]
fn insert_after_load_refines_shared_blocks_in_place() {
    let mut original = LpmTrie::new();
    original.insert(net("192.168.0.0/16"), b"base").unwrap();

    let mut storage = original.pack().unwrap();
    let mut loaded = LpmTrie::load(&mut storage).unwrap();
    // descends through shared blocks and rewrites one of their slots
    loaded.insert(net("192.168.1.0/24"), b"fine").unwrap();

    assert_eq!(lookup(&loaded, "192.168.1.5"), Some(&b"fine"[..]));
    assert_eq!(lookup(&loaded, "192.168.2.5"), Some(&b"base"[..]));

    // repacking the mixed-tier trie keeps both bindings
    let mut second = loaded.pack().unwrap();
    let reloaded = LpmTrie::load(&mut second).unwrap();
    assert_eq!(lookup(&reloaded, "192.168.1.5"), Some(&b"fine"[..]));
    assert_eq!(lookup(&reloaded, "192.168.2.5"), Some(&b"base"[..]));
}

#[test]
fn round_trip_preserves_every_lookup() {
    let table: &[(&str, &str)] = &[
        ("0.0.0.0/0", "default"),
        ("10.0.0.0/8", "private"),
        ("10.1.0.0/16", "site"),
        ("10.1.1.128/25", "upper"),
        ("192.168.1.1/32", "host"),
        ("::/0", "v6-default"),
        ("2001:db8::/32", "doc"),
        ("2001:db8::1/128", "v6-host"),
    ];
    let probes = [
        "10.1.1.200",
        "10.1.1.1",
        "10.2.3.4",
        "11.0.0.1",
        "192.168.1.1",
        "192.168.1.2",
        "2001:db8::1",
        "2001:db8::2",
        "9000::1",
    ];

    let mut original = LpmTrie::new();
    for &(p, v) in table {
        original.insert(net(p), v.as_bytes()).unwrap();
    }

    let mut storage = original.pack().unwrap();
    let loaded = LpmTrie::load(&mut storage).unwrap();
    for probe in probes {
        assert_eq!(lookup(&loaded, probe), lookup(&original, probe), "probe {probe}");
    }

    // the loaded trie is all shared tier; pack it again and re-load
    let mut second = loaded.pack().unwrap();
    let reloaded = LpmTrie::load(&mut second).unwrap();
    for probe in probes {
        assert_eq!(lookup(&reloaded, probe), lookup(&original, probe), "probe {probe}");
    }
}

#[test]
fn header_counts_match_stats_and_dedup() {
    let mut trie = LpmTrie::new();
    trie.insert(net("10.0.0.0/8"), b"dup").unwrap();
    trie.insert(net("172.16.0.0/12"), b"dup").unwrap();
    trie.insert(net("192.168.0.0/16"), b"unique-longer").unwrap();

    let stats = trie.stats();
    let storage = trie.pack().unwrap();

    assert_eq!(header_u32(&storage, 0), 0x4C50_4D00);
    assert_eq!(header_u32(&storage, 1), 1);
    assert_eq!(header_u32(&storage, 2) as usize, stats.ipv4_blocks);
    assert_eq!(header_u32(&storage, 3) as usize, stats.ipv6_blocks);
    // "dup" is interned once
    assert_eq!(header_u32(&storage, 4), 2);
    assert_eq!(header_u32(&storage, 5) as usize, "unique-longer".len() + 1);

    let v4_blocks = header_u32(&storage, 2) as usize;
    let v6_blocks = header_u32(&storage, 3) as usize;
    assert_eq!(header_u32(&storage, 6), 36);
    assert_eq!(header_u32(&storage, 7) as usize, 36 + v4_blocks * 1024);
    assert_eq!(
        header_u32(&storage, 8) as usize,
        36 + (v4_blocks + v6_blocks) * 1024
    );
    assert_eq!(
        storage.len(),
        header_u32(&storage, 8) as usize + 2 * ("unique-longer".len() + 1)
    );
}

#[test]
fn empty_trie_round_trips() {
    let trie = LpmTrie::new();
    let mut storage = trie.pack().unwrap();

    // the root blocks are packed even when nothing was inserted
    assert_eq!(header_u32(&storage, 2), 1);
    assert_eq!(header_u32(&storage, 3), 1);
    assert_eq!(header_u32(&storage, 4), 0);
    assert_eq!(header_u32(&storage, 5), 0);

    let mut loaded = LpmTrie::load(&mut storage).unwrap();
    assert_eq!(lookup(&loaded, "1.2.3.4"), None);
    assert_eq!(lookup(&loaded, "2001:db8::1"), None);

    loaded.insert(net("1.0.0.0/8"), b"one").unwrap();
    assert_eq!(lookup(&loaded, "1.2.3.4"), Some(&b"one"[..]));
}

#[test]
fn empty_value_round_trips() {
    let mut trie = LpmTrie::new();
    trie.insert(net("203.0.113.0/24"), b"").unwrap();
    assert_eq!(lookup(&trie, "203.0.113.9"), Some(&b""[..]));

    let mut storage = trie.pack().unwrap();
    let loaded = LpmTrie::load(&mut storage).unwrap();
    assert_eq!(lookup(&loaded, "203.0.113.9"), Some(&b""[..]));
    assert_eq!(lookup(&loaded, "203.0.114.9"), None);
}

#[test]
fn value_length_is_enforced_at_pack_time() {
    let mut trie = LpmTrie::new();
    trie.insert(net("10.0.0.0/8"), &[0xAB; 255]).unwrap();
    let mut storage = trie.pack().expect("255-byte value must pack");
    let loaded = LpmTrie::load(&mut storage).unwrap();
    assert_eq!(lookup(&loaded, "10.1.2.3"), Some(&[0xAB_u8; 255][..]));

    let mut over = LpmTrie::new();
    over.insert(net("10.0.0.0/8"), &[0xCD; 256]).unwrap();
    let err = over.pack().err().expect("256-byte value must be rejected");
    assert!(matches!(err, Error::ValueTooLong { len: 256, .. }));
}

#[test]
fn load_rejects_short_buffer() {
    let err = LpmTrie::load(&mut []).err().expect("empty buffer must be rejected");
    assert_eq!(err, Error::BufferTooSmall { needed: 36, got: 0 });

    let mut small = [0u8; 20];
    let err = LpmTrie::load(&mut small).err().expect("20 bytes must be rejected");
    assert_eq!(err, Error::BufferTooSmall { needed: 36, got: 20 });
}

#[test]
fn load_rejects_bad_magic() {
    let mut trie = LpmTrie::new();
    trie.insert(net("10.0.0.0/8"), b"x").unwrap();
    let mut storage = trie.pack().unwrap();
    storage[0] ^= 0xFF;

    let err = LpmTrie::load(&mut storage).err().expect("bad magic must be rejected");
    assert!(matches!(err, Error::BadMagic { expected: 0x4C50_4D00, .. }));
}

#[test]
fn load_rejects_unknown_version() {
    let trie = LpmTrie::new();
    let mut storage = trie.pack().unwrap();
    storage[4..8].copy_from_slice(&2u32.to_ne_bytes());

    let err = LpmTrie::load(&mut storage).err().expect("version 2 must be rejected");
    assert_eq!(err, Error::UnsupportedVersion { expected: 1, got: 2 });
}

#[test]
fn load_rejects_truncated_image() {
    let mut trie = LpmTrie::new();
    trie.insert(net("10.0.0.0/8"), b"x").unwrap();
    trie.insert(net("2001:db8::/32"), b"y").unwrap();
    let full = trie.pack().unwrap();

    let mut truncated = full[..full.len() - 1].to_vec();
    let err = LpmTrie::load(&mut truncated).err().expect("truncated image must be rejected");
    assert!(matches!(err, Error::BufferTooSmall { .. }));

    // cutting into the middle of a block region is also caught
    let mut half = full[..40].to_vec();
    let err = LpmTrie::load(&mut half).err().expect("clipped block region must be rejected");
    assert!(matches!(err, Error::BufferTooSmall { .. }));
}

#[test]
fn load_rejects_misaligned_buffer() {
    let trie = LpmTrie::new();
    let image = trie.pack().unwrap();

    let mut shifted = vec![0u8; image.len() + 1];
    shifted[1..].copy_from_slice(&image);
    let err = LpmTrie::load(&mut shifted[1..])
        .err()
        .expect("misaligned buffer must be rejected");
    assert_eq!(err, Error::MisalignedBuffer);
}

fn canonical(addr: u32, plen: u8) -> u32 {
    if plen == 0 {
        0
    } else {
        addr & (!0u32 << (32 - plen))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn packed_image_preserves_lookups(
        entries in pvec((any::<u32>(), 0u8..=32), 1..16),
        probes in pvec(any::<u32>(), 1..24),
    ) {
        let mut trie = LpmTrie::new();
        for &(a, p) in &entries {
            let base = Ipv4Addr::from(canonical(a, p));
            let net: IpNet = format!("{base}/{p}").parse().unwrap();
            trie.insert(net, format!("{base}/{p}").as_bytes()).unwrap();
        }

        let mut storage = trie.pack().unwrap();
        let loaded = LpmTrie::load(&mut storage).unwrap();

        for &probe in probes.iter().chain(entries.iter().map(|(a, _)| a)) {
            let ip = IpAddr::V4(Ipv4Addr::from(probe));
            prop_assert_eq!(loaded.lookup(ip), trie.lookup(ip), "probe {}", ip);
        }
    }
}
