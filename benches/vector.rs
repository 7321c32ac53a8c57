use criterion::{criterion_group, criterion_main, Criterion};
use vm_tree::{GrowthPolicy, VmVector};

fn push(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector push");

    for item_count in [100_000usize, 1_000_000] {
        group.bench_function(format!("push_back u64 x{item_count}"), |b| {
            b.iter(|| {
                let mut v = VmVector::<u64>::map_memory(0).unwrap();
                for i in 0..item_count {
                    v.push(i as u64).unwrap();
                }
                assert_eq!(v.len(), item_count);
            });
        });

        group.bench_function(format!("reserved push_back u64 x{item_count}"), |b| {
            b.iter(|| {
                let mut v = VmVector::<u64>::map_memory(item_count).unwrap();
                for i in 0..item_count {
                    v.push(i as u64).unwrap();
                }
                assert_eq!(v.len(), item_count);
            });
        });
    }
}

fn grow(c: &mut Criterion) {
    let mut group = c.benchmark_group("vector grow");
    group.sample_size(20);

    group.bench_function("grow_to 64 MiB in page steps", |b| {
        let step = 4096 / std::mem::size_of::<u64>();
        let target = (64 << 20) / std::mem::size_of::<u64>();
        b.iter(|| {
            let mut v = VmVector::<u64>::map_memory(0).unwrap();
            let mut size = 0;
            while size < target {
                size += step;
                v.grow_to(size, GrowthPolicy::NoInit).unwrap();
            }
            assert_eq!(v.len(), target);
        });
    });
}

criterion_group!(benches, push, grow);
criterion_main!(benches);
