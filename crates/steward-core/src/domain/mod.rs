//! Domain model (ids, values, sensors, lifecycle, events, effectors, mementos).
//!
//! ここには I/O も非同期処理も置きません。ランタイムは `app` にあります。

pub mod effector;
pub mod entity;
pub mod errors;
pub mod event;
pub mod ids;
pub mod lifecycle;
pub mod location;
pub mod memento;
pub mod policy;
pub mod sensor;
pub mod value;

pub use self::effector::{
    EffectorSpec, EffectorStatus, InvokeOptions, ParameterSpec, Parameters, builtin_specs,
};
pub use self::entity::EntityConfig;
pub use self::errors::{Result, StewardError};
pub use self::event::{EntityFilter, SensorEvent, SensorFilter, SubscriptionFilter};
pub use self::ids::{EntityId, InvocationId, LocationHandleId, PolicyId, SubscriptionId};
pub use self::lifecycle::Lifecycle;
pub use self::location::{LocationAction, LocationHandle, LocationRequirements};
pub use self::memento::{AttributeMemento, EntityMemento, MementoSet};
pub use self::policy::PolicySpec;
pub use self::sensor::{SERVICE_STATE, SERVICE_UP, Sensor};
pub use self::value::{AttributeValue, ValueType};
