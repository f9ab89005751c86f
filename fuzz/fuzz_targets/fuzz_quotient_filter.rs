#![no_main]
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeSet;

fuzz_target!(|data: Vec<u16>| {
    if data.len() < 2 {
        return;
    }
    let q = 2 + (data[0] % 9) as u8; // 2..=10
    let r = 1 + (data[1] % 12) as u8; // 1..=12
    let mut f = quotient_filter::Filter::new(q, r).unwrap();
    let mask = (1u64 << (q + r)) - 1;
    let mut model: BTreeSet<u64> = BTreeSet::new();

    for &word in &data[2..] {
        let h = (word as u64).wrapping_mul(0x9E3779B97F4A7C15) & mask;
        if word % 3 == 0 {
            assert_eq!(f.remove(h).unwrap(), model.remove(&h));
        } else {
            match f.insert(h) {
                Ok(added) => {
                    assert_eq!(added, model.insert(h));
                }
                Err(_) => {
                    assert_eq!(model.len() as u64, f.capacity());
                    assert!(!model.contains(&h));
                }
            }
        }
        assert_eq!(f.len(), model.len() as u64);
        for &m in &model {
            assert!(f.contains(m));
        }
    }
    assert_eq!(f.fingerprints().collect::<BTreeSet<_>>(), model);
});
