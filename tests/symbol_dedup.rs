//! Symbol table deduplication under load.
//!
//! Feeds a large stream of pseudo-random strings with heavy repetition
//! through a symbol table and checks that ids are handed out exactly once
//! per distinct string, that every id resolves back to its bytes, and
//! that the table survives a close/reopen cycle. The generator is a
//! plain xorshift so runs are reproducible.

use hashbrown::HashMap;
use stratum::SymbolTable;
use tempfile::tempdir;

fn next(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

// Draws from a pool of ~2000 distinct strings, empty string included.
fn draw(state: &mut u64) -> Vec<u8> {
    let roll = next(state);
    if roll % 199 == 0 {
        return Vec::new();
    }
    let pool_id = roll % 2000;
    format!("symbol-{pool_id:04}").into_bytes()
}

#[test]
fn hundred_thousand_inserts_dedup_to_the_pool() {
    let dir = tempdir().unwrap();
    let mut table = SymbolTable::open(dir.path(), "names").unwrap();

    let mut state = 0xdead_beef_cafe_f00d;
    let mut expected: HashMap<Vec<u8>, u32> = HashMap::new();

    for _ in 0..100_000 {
        let bytes = draw(&mut state);
        let id = table.get_or_add(&bytes).unwrap();
        match expected.get(&bytes) {
            Some(&known) => assert_eq!(id, known, "{:?} changed id", bytes),
            None => {
                expected.insert(bytes, id);
            }
        }
    }

    // Far fewer ids than inserts: only the pool survives.
    assert_eq!(table.len() as usize, expected.len());
    assert!(table.len() <= 2001);

    for (bytes, id) in &expected {
        assert_eq!(table.symbol(*id).unwrap(), bytes.as_slice());
    }
}

#[test]
fn empty_string_is_one_distinct_symbol() {
    let dir = tempdir().unwrap();
    let mut table = SymbolTable::open(dir.path(), "names").unwrap();

    let empty = table.get_or_add(b"").unwrap();
    let other = table.get_or_add(b"x").unwrap();
    assert_eq!(table.get_or_add(b"").unwrap(), empty);
    assert_ne!(empty, other);
    assert_eq!(table.symbol(empty).unwrap(), b"");
    assert_eq!(table.len(), 2);
}

#[test]
fn reopen_preserves_ids_and_keeps_deduplicating() {
    let dir = tempdir().unwrap();

    let (a, b) = {
        let mut table = SymbolTable::open(dir.path(), "names").unwrap();
        let a = table.get_or_add(b"aurora").unwrap();
        let b = table.get_or_add(b"borealis").unwrap();
        table.flush().unwrap();
        (a, b)
    };

    let mut table = SymbolTable::open(dir.path(), "names").unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.symbol(a).unwrap(), b"aurora");
    assert_eq!(table.get_or_add(b"borealis").unwrap(), b);
    assert_eq!(table.get_or_add(b"cirrus").unwrap(), 2);
}

#[test]
fn shared_prefixes_do_not_collide() {
    let dir = tempdir().unwrap();
    let mut table = SymbolTable::open(dir.path(), "names").unwrap();

    let ids: Vec<u32> = (1..=64)
        .map(|n| table.get_or_add(&vec![b'a'; n]).unwrap())
        .collect();

    for (i, &id) in ids.iter().enumerate() {
        assert_eq!(table.symbol(id).unwrap().len(), i + 1);
    }
    assert_eq!(table.len(), 64);
}
