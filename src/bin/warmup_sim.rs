// Simulated two-node warmup prefetch that prints every published snapshot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use warmup_prefetch::api::simple::init_tracing;
use warmup_prefetch::config::PrefetchConfig;
use warmup_prefetch::plan::{Span, WarmupPlan};
use warmup_prefetch::source::memory::{pattern_blocks, MemoryDrive, MemoryLog};
use warmup_prefetch::{PrefetchEvent, Prefetcher};

const BLOCK_SIZE: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let latency = Duration::from_millis(2);
    let metadata = MemoryLog::new("metadata", pattern_blocks(64, 512)).with_latency(latency);
    let blobs = MemoryLog::new("blobs", pattern_blocks(512, BLOCK_SIZE)).with_latency(latency);
    let drive = Arc::new(MemoryDrive::new(metadata, Some(blobs)));

    let span = |start, end| Span::new(start, end).ok_or_else(|| anyhow::anyhow!("empty span"));
    drive.put_plan(&WarmupPlan {
        metadata: vec![span(0, 1)?, span(3, 4)?, span(8, 24)?],
        blobs: vec![span(0, 256)?, span(300, 301)?],
    });

    let config = PrefetchConfig {
        interval_ms: 50,
        ..PrefetchConfig::default()
    };
    let prefetcher = Prefetcher::new(drive, config);
    let mut events = prefetcher.subscribe();
    let run = prefetcher.start(None);

    while let Some(event) = events.recv().await {
        match event {
            PrefetchEvent::Update(stats) => {
                println!(
                    "peers={} blocks={} bytes={} speed={:.0}B/s progress={:.2}",
                    stats.peers,
                    stats.download.blocks,
                    stats.download.bytes,
                    stats.download.speed,
                    stats.download.progress
                );
                if stats.download.progress >= 1.0 {
                    break;
                }
            }
            PrefetchEvent::Mirror(diff) => println!("{:?} {}", diff.op, diff.key),
            PrefetchEvent::Failed(e) => return Err(e.into()),
        }
    }

    let stats = run.wait().await?;
    println!("done: {} blocks", stats.download.blocks);
    Ok(())
}
