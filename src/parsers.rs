pub mod common;
pub mod generic_parser;
pub mod whatsapp_parser;

pub use common::{AdapterError, Attachment, ChannelAdapter, InboundEvent, adapter_for};
pub use generic_parser::GenericAdapter;
pub use whatsapp_parser::WhatsAppAdapter;
