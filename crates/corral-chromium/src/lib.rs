//! Chromium backend for Corral clusters.
//!
//! [`find_chrome_binary`] is always available. The CDP driver itself needs
//! the `browser` feature:
//!
//! ```rust,ignore
//! use corral_chromium::ChromiumDriver;
//! use corral_core::{Cluster, ClusterOptions};
//!
//! let cluster = Cluster::launch(ChromiumDriver::new(), ClusterOptions::default()).await?;
//! ```

pub mod binary;
#[cfg(feature = "browser")]
pub mod driver;

pub use binary::find_chrome_binary;
#[cfg(feature = "browser")]
pub use driver::{ChromiumBrowser, ChromiumDriver};
#[cfg(feature = "browser")]
pub use chromiumoxide::Page;
