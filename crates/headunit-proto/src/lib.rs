// Re-export compiled gRPC protos.
//
// The `.proto` files live in this crate so the daemon and any Rust client share
// a single type source.

pub mod headunit {
    pub mod afm {
        pub mod v1 {
            tonic::include_proto!("headunit.afm.v1");
        }
    }
}

pub use headunit::afm::v1 as afm_v1;

/// Well-known service identity.
pub const SERVICE_NAME: &str = "com.headunit.AppLifecycle";
pub const OBJECT_PATH: &str = "/com/headunit/AppLifecycle";
