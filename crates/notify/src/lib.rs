//! Approval card delivery for remediation proposals.
//!
//! The analyzer hands every heal proposal to a [`NotifyChannel`] as a
//! [`CardMessage`]: a recipient, a fixed card template (ID + version) and the
//! [`CardVariables`] the template renders. Delivery is fire-and-forget from the
//! analyzer's point of view; approval callbacks are handled elsewhere.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{CardMessage, CardVariables, FeishuChannel, NotifyChannel, ReceiveIdType};
//!
//! # async fn run() -> Result<(), notify::ChannelError> {
//! let channel = FeishuChannel::from_env(
//!     "https://open.feishu.cn",
//!     "FEISHU_APP_ID",
//!     "FEISHU_APP_SECRET",
//!     std::time::Duration::from_secs(15),
//! );
//!
//! let message = CardMessage::new(
//!     "oc_123",
//!     ReceiveIdType::ChatId,
//!     "AAqhGHg0Wgux8",
//!     "0.0.9",
//!     CardVariables::default(),
//! );
//! channel.deliver(&message).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod card;
pub mod channels;
pub mod error;

pub use card::{CardMessage, CardPatch, CardVariables, ReceiveIdType};
pub use channels::feishu::FeishuChannel;
pub use channels::{DeliveryReceipt, NotifyChannel};
pub use error::ChannelError;
