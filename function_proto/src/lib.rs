//! Generated protobuf bindings for the `homo.Function` service.
//!
//! `FunctionMessage` is both the request and the response of the unary
//! `Call` method. Encoding and decoding go through the prost-generated
//! `Message` impl; there is no hand-written codec.

#[allow(non_camel_case_types)]
pub mod homo {
    tonic::include_proto!("homo");
}

pub mod descriptor {
    pub const FUNCTION_FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("function_descriptor");
}

pub use homo::{
    function_client::FunctionClient,
    function_server::{Function, FunctionServer},
    FunctionMessage,
};
pub use prost::{DecodeError, Message};

/// Fully qualified name of the service, as used in gRPC paths and reflection.
pub const FUNCTION_SERVICE_NAME: &str = "homo.Function";
