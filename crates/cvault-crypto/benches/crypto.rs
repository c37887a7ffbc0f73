use cvault_core::types::TransformKind;
use cvault_crypto::{
    decrypt_chunk, encrypt_chunk, generate_file_key, ChunkContext, ChunkProcessor,
};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_chunk(bencher: divan::Bencher, size: usize) {
    let file_key = generate_file_key();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            encrypt_chunk(
                divan::black_box(&file_key),
                0,
                divan::black_box(42),
                divan::black_box(&data),
            )
            .unwrap()
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_chunk(bencher: divan::Bencher, size: usize) {
    let file_key = generate_file_key();
    let data = make_data(size);
    let sealed = encrypt_chunk(&file_key, 0, 42, &data).unwrap();
    let mut stored = sealed.ciphertext.clone();
    stored.extend_from_slice(&sealed.tag);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            decrypt_chunk(
                divan::black_box(&file_key),
                0,
                divan::black_box(42),
                divan::black_box(&sealed.nonce),
                divan::black_box(&stored),
            )
            .unwrap()
        });
}

#[divan::bench(args = [65536, 5242880])]
fn bench_process_chunk(bencher: divan::Bencher, size: usize) {
    let processor = ChunkProcessor::default();
    let file_key = generate_file_key();
    let data = make_data(size);
    let ctx = ChunkContext {
        file_id: 42,
        index: 0,
    };
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            processor
                .process(
                    divan::black_box(&file_key),
                    ctx,
                    divan::black_box(&data),
                    TransformKind::Identity,
                )
                .unwrap()
        });
}

fn main() {
    divan::main();
}
