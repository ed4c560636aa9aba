//! In-process relay demo: one publisher, two readers, a registry snapshot.
//!
//! Run with: cargo run --example relay

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use mediarelay::auth::Credentials;
use mediarelay::conf::{Conf, LogDestination, LogLevel, PathConf};
use mediarelay::logging::init_logging;
use mediarelay::media::{Format, MediaDescription, MediaType, SessionDescription, Unit};
use mediarelay::path::{ManagerOptions, PathManager};

#[tokio::main]
async fn main() -> mediarelay::Result<()> {
    init_logging(
        LogLevel::Debug,
        &[LogDestination::Stdout],
        "relay.log".as_ref(),
    )?;

    let mut conf = Conf::default();
    conf.paths.insert("live/demo".into(), PathConf::default());

    let manager = PathManager::spawn(conf, ManagerOptions::default())?;
    let ip: IpAddr = "127.0.0.1".parse().unwrap();

    // Publisher side: announce one H.264 track and feed units.
    let desc = SessionDescription::new(vec![MediaDescription::with_format(
        MediaType::Video,
        Format::h264(),
    )]);
    let publisher = manager
        .add_publisher("live/demo", Credentials::default(), ip, desc, false)
        .await?;

    // Two independent readers with their own delivery callbacks.
    for reader_num in 0..2 {
        let reader = manager
            .add_reader("live/demo", Credentials::default(), ip)
            .await?;
        reader.stream().add_reader(
            reader.reader(),
            0,
            0,
            Box::new(move |unit| {
                tracing::info!(reader = reader_num, pts = unit.pts, "unit delivered");
                Ok(())
            }),
        )?;
        // Leaked for the demo's lifetime; a real session would hold this
        // handle and close it on disconnect.
        std::mem::forget(reader);
    }

    let stream = Arc::clone(publisher.stream());
    let feeder = tokio::spawn(async move {
        for i in 0..30 {
            let unit = Unit::new(i * 33_000_000, Bytes::from_static(&[0x65, 0x01, 0x02]))
                .random_access();
            if stream.write_unit(0, 0, unit).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(33)).await;
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;

    let snapshot = manager.api_list().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot).unwrap());

    let _ = feeder.await;
    publisher.close().await;
    manager.close().await;
    Ok(())
}
