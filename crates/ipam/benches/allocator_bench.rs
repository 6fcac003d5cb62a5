//! Performance benchmarks for the bitset and the local allocator

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipam::{AddressBitset, LocalAllocatorConfig, LocalBitsetAllocator, NetworkAddressSpace};

/// Benchmark draining a block with sequential allocation
fn bench_sequential_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("ip_allocation_sequential");

    for prefix in [24u8, 20, 16].iter() {
        let network = NetworkAddressSpace::parse(&format!("10.100.0.0/{}", prefix)).unwrap();
        let capacity = 2u32.pow(32 - *prefix as u32) - 2; // Minus network, broadcast

        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(BenchmarkId::new("prefix", prefix), prefix, |b, _| {
            b.iter(|| {
                let allocator = LocalBitsetAllocator::new(network).unwrap();
                let mut count = 0u32;
                while allocator.find_available_ip_and_use().is_ok() {
                    count += 1;
                }
                black_box(count)
            });
        });
    }

    group.finish();
}

/// Benchmark a single allocation on a fresh allocator
fn bench_single_allocation(c: &mut Criterion) {
    let network = NetworkAddressSpace::parse("10.100.0.0/24").unwrap();

    c.bench_function("ip_allocation_single", |b| {
        b.iter(|| {
            let allocator = LocalBitsetAllocator::new(network).unwrap();
            black_box(allocator.find_available_ip_and_use())
        });
    });
}

/// Benchmark allocation after releasing every other address
fn bench_fragmented_allocation(c: &mut Criterion) {
    let network = NetworkAddressSpace::parse("10.100.0.0/24").unwrap();

    c.bench_function("ip_allocation_fragmented", |b| {
        b.iter_batched(
            || {
                let allocator = LocalBitsetAllocator::new(network).unwrap();
                let mut allocated = Vec::new();
                for _ in 0..126 {
                    if let Ok(ip) = allocator.find_available_ip_and_use() {
                        allocated.push(ip);
                    }
                }
                for (i, ip) in allocated.iter().enumerate() {
                    if i % 2 == 0 {
                        allocator.un_use_ip(*ip).unwrap();
                    }
                }
                allocator
            },
            |allocator| {
                let mut count = 0;
                while allocator.find_available_ip_and_use().is_ok() {
                    count += 1;
                }
                black_box(count)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Benchmark finding the first free slot near the end of a large, full block
fn bench_find_in_full_block(c: &mut Criterion) {
    let network = NetworkAddressSpace::parse("10.0.0.0/12").unwrap();
    let config = LocalAllocatorConfig { max_host_bits: 20 };
    let allocator = LocalBitsetAllocator::with_config(network, &config).unwrap();
    while allocator.find_available_ip_and_use().is_ok() {}
    let last_host = network.last_address();
    allocator.un_use_ip(last_host).unwrap();

    c.bench_function("ip_find_in_full_block", |b| {
        b.iter(|| black_box(allocator.find_available_ip()));
    });
}

/// Benchmark population count over large bitsets
fn bench_bitset_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitset_count_ones");

    for bits in [1usize << 8, 1 << 16, 1 << 24].iter() {
        let mut bitset = AddressBitset::new(*bits);
        for i in (0..*bits).step_by(3) {
            bitset.set(i);
        }

        group.throughput(Throughput::Elements(*bits as u64));
        group.bench_with_input(BenchmarkId::new("bits", bits), bits, |b, _| {
            b.iter(|| black_box(bitset.count_ones()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sequential_allocation,
    bench_single_allocation,
    bench_fragmented_allocation,
    bench_find_in_full_block,
    bench_bitset_count,
);
criterion_main!(benches);
