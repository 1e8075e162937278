mod metadata;
mod ticket;

pub use self::metadata::{TicketMetadata, title_tags};
pub use self::ticket::TicketId;
