#![feature(test)]
extern crate test;

use quotient_filter::Filter;
use test::Bencher;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
    x ^ (x >> 31)
}

fn full_filter(q: u8, r: u8) -> Filter {
    let mut f = Filter::new(q, r).unwrap();
    let mut i = 0;
    while f.len() < f.capacity() {
        let _ = f.insert(splitmix64(i));
        i += 1;
    }
    f
}

#[bench]
fn bench_new(b: &mut Bencher) {
    b.iter(|| Filter::new(12, 8).unwrap());
}

#[bench]
fn bench_insert_to_capacity(b: &mut Bencher) {
    b.iter(|| full_filter(12, 8));
}

#[bench]
fn bench_contains_hit(b: &mut Bencher) {
    let f = full_filter(16, 8);
    let mut i = 0;
    b.iter(|| {
        i += 1;
        f.contains(splitmix64(i % f.len()))
    })
}

#[bench]
fn bench_contains_miss(b: &mut Bencher) {
    let f = full_filter(16, 8);
    let mut i = 0;
    b.iter(|| {
        i += 1;
        f.contains(splitmix64(1 << 32 | i))
    })
}

#[bench]
fn bench_drain_by_remove(b: &mut Bencher) {
    let f = full_filter(12, 8);
    let fingerprints: Vec<u64> = f.fingerprints().collect();
    b.iter(|| {
        let mut f = f.clone();
        for &h in &fingerprints {
            f.remove(h).unwrap();
        }
        f
    });
}

#[bench]
fn bench_merge(b: &mut Bencher) {
    let f1 = full_filter(12, 8);
    let f2 = full_filter(12, 8);
    b.iter(|| f1.merge(&f2).unwrap());
}

#[bench]
fn bench_iterate(b: &mut Bencher) {
    let f = full_filter(12, 8);
    b.iter(|| f.fingerprints().sum::<u64>());
}
