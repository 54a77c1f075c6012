//! Host tun device plumbing
//!
//! One layer-3 tun interface carries whole IPv4 datagrams with no framing:
//! the read loop delivers each packet to the capture facade, and the writer
//! half implements the capture's `Device` seam. The interface needs a /31
//! covering the capture address and its synthesised peer (address + 1) so
//! forged packets route back in.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::capture::{Capture, Device};
use crate::error::Result;

/// Tun interface configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "trellis0".to_string(),
            address: Ipv4Addr::new(10, 7, 0, 2),
            // A /31: the capture address plus the synthesised peer.
            netmask: Ipv4Addr::new(255, 255, 255, 254),
            mtu: 1500,
        }
    }
}

pub struct TunReader {
    inner: ReadHalf<tun2::AsyncDevice>,
}

pub struct TunWriter {
    inner: Mutex<WriteHalf<tun2::AsyncDevice>>,
}

/// Create and configure the tun interface, split into its two directions.
pub fn create(config: &TunConfig) -> Result<(TunReader, TunWriter)> {
    info!(
        "creating tun interface {} at {}/{}",
        config.name, config.address, config.netmask
    );

    let mut device = tun2::Configuration::default();
    device
        .tun_name(&config.name)
        .address(config.address)
        .netmask(config.netmask)
        .mtu(config.mtu)
        .up();

    #[cfg(target_os = "linux")]
    device.platform_config(|platform| {
        platform.packet_information(false);
    });

    let device = tun2::create_as_async(&device)
        .map_err(|error| crate::error::Error::Config(format!("tun creation failed: {}", error)))?;
    let (reader, writer) = tokio::io::split(device);
    Ok((
        TunReader { inner: reader },
        TunWriter {
            inner: Mutex::new(writer),
        },
    ))
}

#[async_trait]
impl Device for TunWriter {
    async fn send(&self, packet: &[u8]) -> Result<()> {
        self.inner.lock().await.write_all(packet).await?;
        Ok(())
    }
}

/// Deliver packets from the tun device to the capture until the process
/// exits. Individual read failures are logged and the loop re-entered.
pub async fn run(mut reader: TunReader, capture: Arc<Capture>) {
    let mut buffer = vec![0u8; 65535];
    loop {
        match reader.inner.read(&mut buffer).await {
            Ok(0) => {
                warn!("tun device closed");
                break;
            }
            Ok(size) => capture.land(buffer[..size].to_vec()).await,
            Err(error) => {
                warn!("tun read failed: {}", error);
            }
        }
    }
}
