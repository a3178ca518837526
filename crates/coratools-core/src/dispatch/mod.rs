//! Event marshalling onto the single dispatch thread

pub mod client;
pub mod dispatcher;
pub mod event;

pub use client::{ClientRef, ClientToken, Delivery, TokenSource};
pub use dispatcher::{Dispatcher, EventTarget};
pub use event::{
    Envelope, Event, EventSender, Notification, NotificationPayload, PostError, SessionEvent,
    TransportEvent,
};
