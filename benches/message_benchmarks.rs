use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pubsub_testkit::pubsub::types::{PublishRequest, PubsubMessage};
use pubsub_testkit::storage::memory::InMemoryBackend;
use pubsub_testkit::storage::StorageBackend;
use pubsub_testkit::types::{Message, SubscriptionConfig, TopicConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

const PROJECT: &str = "projects/bench-project";

/// Topic with `subscriptions` pull subscriptions attached
async fn create_topic(backend: &Arc<dyn StorageBackend>, subscriptions: usize) -> (String, Vec<String>) {
    let topic = format!("{}/topics/bench-{}", PROJECT, uuid::Uuid::new_v4().simple());
    backend.create_topic(TopicConfig::new(&topic)).await.unwrap();

    let mut names = Vec::with_capacity(subscriptions);
    for _ in 0..subscriptions {
        let name = format!("{}/subscriptions/bench-{}", PROJECT, uuid::Uuid::new_v4().simple());
        backend
            .create_subscription(SubscriptionConfig::new(&name, &topic))
            .await
            .unwrap();
        names.push(name);
    }
    (topic, names)
}

fn create_test_message(size: usize) -> Message {
    Message::new(vec![b'x'; size], HashMap::new(), None)
}

/// Benchmark publish with different fan-out widths
fn bench_publish_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("publish_fan_out");

    for subscriptions in [1, 5, 25].iter() {
        let backend = Arc::new(InMemoryBackend::new()) as Arc<dyn StorageBackend>;
        let (topic, _) = rt.block_on(create_topic(&backend, *subscriptions));

        group.throughput(Throughput::Elements(*subscriptions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(subscriptions), subscriptions, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(backend.publish(&topic, vec![create_test_message(1024)]).await.unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark a full publish, pull, acknowledge cycle with different batch sizes
fn bench_publish_pull_ack(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("publish_pull_ack");

    for batch_size in [1, 10, 100].iter() {
        let backend = Arc::new(InMemoryBackend::new()) as Arc<dyn StorageBackend>;
        let (topic, subscriptions) = rt.block_on(create_topic(&backend, 1));
        let subscription = subscriptions[0].clone();

        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &size| {
            b.to_async(&rt).iter(|| async {
                let messages = (0..size).map(|_| create_test_message(256)).collect();
                backend.publish(&topic, messages).await.unwrap();

                let received = backend.pull(&subscription, size as u32).await.unwrap();
                let ack_ids: Vec<String> = received.into_iter().map(|r| r.ack_id).collect();
                backend.acknowledge(&subscription, &ack_ids).await.unwrap();
                black_box(ack_ids.len());
            });
        });
    }
    group.finish();
}

/// Benchmark decoding a REST publish body (JSON + base64) of different sizes
fn bench_publish_request_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_request_decode");

    for size in [100, 1024, 10240, 102400].iter() {
        let request = PublishRequest {
            messages: vec![PubsubMessage {
                data: vec![b'x'; *size],
                ..Default::default()
            }],
        };
        let body = serde_json::to_vec(&request).unwrap();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let decoded: PublishRequest = serde_json::from_slice(black_box(&body)).unwrap();
                black_box(decoded);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_publish_fan_out,
    bench_publish_pull_ack,
    bench_publish_request_decode,
);
criterion_main!(benches);
