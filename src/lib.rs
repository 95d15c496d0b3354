pub mod error;
pub mod hash;
pub mod registry;
pub mod shared_ptr;
pub mod sync {
    pub mod counter;
    pub mod gate;
    pub mod publish;
}

pub use error::{ Error, InitError, Result };
pub use registry::{ KeyedRegistry, ObjectHandle, RegistryOptions };
pub use shared_ptr::{ SharedPtr, WeakPtr };
