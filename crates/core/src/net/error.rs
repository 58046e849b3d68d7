use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] slsk_types::codec::CodecError),

    #[error("command channel disconnected")]
    ChannelDisconnected,
}
