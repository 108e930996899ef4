pub mod errors;
pub mod id;
pub mod time;

pub use errors::{ConfigError, RelayError, StoreError};
pub use id::{
    is_valid_session_token, new_device_id, new_device_secret, new_message_id, new_pairing_code,
    new_pairing_passphrase, new_session_token,
};
pub use time::now_millis;

pub type Result<T> = std::result::Result<T, RelayError>;
