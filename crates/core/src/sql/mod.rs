pub mod guard;
pub mod render;
pub mod validator;

pub use guard::{check_read_only, UnsafeStatement};
pub use render::{RenderError, SqlRenderer};
pub use validator::{SqlValidator, SqlViolation, ValidatedSql, ValidationFailure};
