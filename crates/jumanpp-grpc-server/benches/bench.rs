use core::fmt;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use jumanpp_grpc_core::proto::{
    AnalysisRequest, RequestType, jumanpp_jumandic_client::JumanppJumandicClient,
};

use futures::stream::FuturesUnordered;
use std::{
    net::TcpStream,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::Builder;
use tokio_stream::StreamExt;
use tonic::{
    codec::CompressionEncoding,
    transport::{Channel, Uri},
};

const SENTENCES: [&str; 4] = [
    "外国人参政権",
    "東京タワーは1958年に完成した",
    "すもももももももものうち",
    "Juman++はRNNを使った形態素解析器です",
];

#[derive(Clone, Copy, Debug)]
enum Compression {
    None,
    Gzip,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl From<Compression> for Option<CompressionEncoding> {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => None,
            Compression::Gzip => Some(CompressionEncoding::Gzip),
            Compression::Zstd => Some(CompressionEncoding::Zstd),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct GrpcBenchParams {
    sentences_per_client: u64,
    concurrency: usize,
    compression: Compression,
}

fn request(i: u64) -> AnalysisRequest {
    AnalysisRequest {
        sentence: SENTENCES[i as usize % SENTENCES.len()].to_string(),
        key: i.to_string(),
        r#type: RequestType::Normal as i32,
    }
}

fn client(channel: &Channel, compression: Compression) -> JumanppJumandicClient<Channel> {
    let mut client = JumanppJumandicClient::new(channel.clone());
    if let Some(encoding) = compression.into() {
        client = client.accept_compressed(encoding).send_compressed(encoding)
    }
    client
}

fn grpc_bench(c: &mut Criterion) {
    let uri = Uri::try_from("http://127.0.0.1:50051").expect("Invalid URI");
    // Start the server. This may require a full compilation so set the timeout
    // high. Adjust features and CLI args to the server as necessary.
    let mut server = Command::new("cargo")
        .args([
            "run",
            "--bin",
            "jumanpp-grpc-server",
            "--release",
            "--",
            "--port",
            "50051",
            "--cache-capacity",
            "64",
        ])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("Failed to start jumanpp-grpc-server");
    wait_for_port(uri.authority().expect("missing authority").as_str(), 300);

    let sentence_cases = [16, 256];
    let concurrency_cases = [1, 4, 16];
    let compression_cases = [Compression::None, Compression::Zstd, Compression::Gzip];

    let mut cases = Vec::new();
    for &sentences_per_client in &sentence_cases {
        for &concurrency in &concurrency_cases {
            for &compression in &compression_cases {
                cases.push(GrpcBenchParams {
                    sentences_per_client,
                    concurrency,
                    compression,
                });
            }
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for (group_name, streaming) in [("grpc/lattice_dump", false), ("grpc/lattice_dump_stream", true)] {
        for params in &cases {
            let mut group = c.benchmark_group(group_name);
            group.throughput(Throughput::Elements(
                params.sentences_per_client * params.concurrency as u64,
            ));

            group.bench_function(
                format!(
                    "elems/{}/conc/{}/comp/{}",
                    params.sentences_per_client, params.concurrency, params.compression,
                ),
                |b| {
                    b.to_async(&rt).iter_custom(|iters| {
                        let uri = uri.clone();
                        async move {
                            let channel = Channel::builder(uri)
                                .connect()
                                .await
                                .expect("Failed to connect to server");

                            let start = Instant::now();
                            for _ in 0..iters {
                                run_clients(&channel, params, streaming).await;
                            }
                            start.elapsed()
                        }
                    });
                },
            );

            group.finish();
        }
    }

    if server.kill().is_err() {
        eprintln!("failed to kill server");
    }
}

async fn run_clients(channel: &Channel, params: &GrpcBenchParams, streaming: bool) {
    let mut tasks = FuturesUnordered::new();

    for _ in 0..params.concurrency {
        let mut client = client(channel, params.compression);
        let count = params.sentences_per_client;

        tasks.push(tokio::spawn(async move {
            if streaming {
                let outbound = tokio_stream::iter((0..count).map(request));
                let mut replies = client
                    .lattice_dump_stream(outbound)
                    .await
                    .expect("stream call failed")
                    .into_inner();

                let mut expected = 0;
                while let Some(reply) = replies.next().await {
                    let reply = reply.expect("reply");
                    assert_eq!(reply.comment, expected.to_string(), "replies out of order");
                    expected += 1;
                }
                assert_eq!(expected, count);
            } else {
                for i in 0..count {
                    let reply = client
                        .lattice_dump(request(i))
                        .await
                        .expect("unary call failed")
                        .into_inner();
                    assert!(!reply.nodes.is_empty());
                }
            }
        }));
    }

    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

pub fn wait_for_port(addr: &str, timeout_secs: u64) {
    let start = Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Server did not start listening on {}", addr);
}

criterion_group!(grpc_benches, grpc_bench);
criterion_main!(grpc_benches);
