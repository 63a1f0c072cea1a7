pub mod device;
pub mod user;

pub use device::{
    Device, DeviceKind, DeviceSummary, GeneratorDevice, NewDevice, PhoneDevice, PhoneMethod,
    StaticDevice,
};
pub use user::User;
