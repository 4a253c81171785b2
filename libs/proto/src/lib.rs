//! Container Runtime Interface wire types.
//!
//! Two protocol variants are carried side by side. `runtime.v1` is the
//! shape the rest of the workspace speaks; `runtime.v1alpha2` responses are
//! upgraded into it with the `From` impls in [`convert`].
//!
//! Only the RPCs the node agent issues are included (`Version`,
//! `ListContainers`, `ListImages`, `RemoveImage`). Server traits are
//! generated too, so tests can stand up a fake runtime.

pub mod convert;

pub mod runtime {
    pub mod v1 {
        include!("gen/runtime.v1.rs");

        pub use image_service_client::ImageServiceClient;
        pub use image_service_server::{ImageService, ImageServiceServer};
        pub use runtime_service_client::RuntimeServiceClient;
        pub use runtime_service_server::{RuntimeService, RuntimeServiceServer};
    }

    pub mod v1alpha2 {
        include!("gen/runtime.v1alpha2.rs");

        pub use image_service_client::ImageServiceClient;
        pub use image_service_server::{ImageService, ImageServiceServer};
        pub use runtime_service_client::RuntimeServiceClient;
        pub use runtime_service_server::{RuntimeService, RuntimeServiceServer};
    }
}
