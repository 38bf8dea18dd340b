pub mod actor;

pub use actor::{USER_ID_HEADER, USER_ROLE_HEADER};
