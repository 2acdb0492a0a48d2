//! Replica Core — rows, order-preserving index encoding, field conditions,
//! table descriptors, and change events.

pub mod change;
pub mod clock;
pub mod condition;
pub mod encoding;
pub mod hash;
pub mod schema;
pub mod types;

pub use change::{Change, ChangeEvent, EventType};
pub use clock::{ClockSource, ManualClock, SystemClock, Timestamp};
pub use condition::{Condition, ConditionError, FieldCondition, Filter, IndexRange};
pub use schema::{CalcInputs, CalculatedField, Dependency, Link, TableInfo};
pub use types::{Key, Row, Value, CALCULATED_FIELD};
