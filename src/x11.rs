//! Shared X11 connection used by the X11 probe and injector.

use std::env;

use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use tracing::info;
use x11rb::connection::Connection as _;
use x11rb::connection::RequestConnection as _;
use x11rb::protocol::screensaver;
use x11rb::protocol::xproto::Window;
use x11rb::protocol::xtest;
use x11rb::rust_connection::RustConnection;

/// X extensions the daemon may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// MIT-SCREEN-SAVER, for idle time.
    ScreenSaver,
    /// XTEST, for synthetic input.
    XTest,
}

impl Extension {
    fn name(self) -> &'static str {
        match self {
            Self::ScreenSaver => screensaver::X11_EXTENSION_NAME,
            Self::XTest => xtest::X11_EXTENSION_NAME,
        }
    }
}

/// An open display connection plus the root window of the default screen.
#[derive(Debug)]
pub struct X11Session {
    conn: RustConnection,
    root: Window,
}

impl X11Session {
    /// Connect to `$DISPLAY`.
    pub fn connect() -> Result<Self> {
        let display_name = env::var("DISPLAY").context("DISPLAY is not set")?;
        Self::open(&display_name)
    }

    /// Connect to a named display such as `:0`.
    pub fn open(display_name: &str) -> Result<Self> {
        info!("Connecting to X display {}", display_name);

        let (conn, screen_num) = x11rb::connect(Some(display_name))
            .with_context(|| format!("Failed to connect to X display {display_name}"))?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .with_context(|| format!("X server has no screen {screen_num}"))?;

        debug!("Connected to X server, root window 0x{:x}", root);
        Ok(Self { conn, root })
    }

    /// Fail unless the server advertises `ext`.
    pub fn require(&self, ext: Extension) -> Result<()> {
        let present = self
            .conn
            .extension_information(ext.name())
            .with_context(|| format!("Failed to query {} extension", ext.name()))?
            .is_some();

        if !present {
            anyhow::bail!("X server does not support the {} extension", ext.name());
        }
        debug!("{} extension present", ext.name());
        Ok(())
    }

    pub fn conn(&self) -> &RustConnection {
        &self.conn
    }

    pub fn root(&self) -> Window {
        self.root
    }
}
