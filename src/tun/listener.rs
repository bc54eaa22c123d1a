//! Listener that yields a single TUN "connection".

use crate::error::VpnResult;
use crate::tun::device::{add_routes, os_route_destinations, TunConfig, TunDevice};
use crate::tun::{TunConn, TUN_NAME_ENV};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Creates the device on construction and hands it out on the first accept.
/// Later accepts block until the listener is closed.
pub struct TunListener {
    name: String,
    config: TunConfig,
    conn: Mutex<Option<TunConn>>,
    closed: CancellationToken,
}

impl TunListener {
    /// Create the interface, install its routes, and export its name.
    pub async fn create(config: TunConfig) -> VpnResult<Self> {
        let device = TunDevice::create(&config)?;
        let name = device.name().to_string();

        let dests = os_route_destinations(config.address, &config.routes);
        let guard = add_routes(&name, &dests).await?;

        std::env::set_var(TUN_NAME_ENV, &name);

        let (reader, writer) = device.split()?;
        let conn = TunConn {
            name: name.clone(),
            reader: Box::new(reader),
            writer: Box::new(writer),
            routes: Some(guard),
        };
        Ok(Self::from_conn(config, conn))
    }

    /// Wrap an already-built connection.
    pub fn from_conn(config: TunConfig, conn: TunConn) -> Self {
        Self {
            name: conn.name.clone(),
            config,
            conn: Mutex::new(Some(conn)),
            closed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TunConfig {
        &self.config
    }

    /// Take the connection, or wait until closed once it has been taken.
    pub async fn accept(&self) -> Option<TunConn> {
        let taken = match self.conn.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if taken.is_some() {
            return taken;
        }
        self.closed.cancelled().await;
        None
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}
