use std::{env, path::PathBuf};

use anyhow::Result;

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=../proto/function.proto");

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .bytes([".homo.FunctionMessage.Payload"])
        .file_descriptor_set_path(out_dir.join("function_descriptor.bin"))
        .compile_protos(&["../proto/function.proto"], &["../proto"])?;

    Ok(())
}
