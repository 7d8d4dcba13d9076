pub mod chart;
pub mod intent;
pub mod result;
pub mod schema;
pub mod sql;
pub mod turn;
