pub mod message;

pub use message::{
    ChatType, Envelope, Message, MessageType, NoticeTarget, ReadReceipt, ReadyAuth, SendCode,
};
