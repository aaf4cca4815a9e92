// =============================================================================
// BUOY TRACKER — Build Script (Proto Compilation)
// =============================================================================
// Compiles the upstream Meshtastic .proto schema into Rust types at build
// time. We define the types manually in src/proto.rs for faster iteration;
// enable this for builds that must track schema changes upstream.
// =============================================================================

fn main() {
    // Uncomment for production proto compilation against vendored .proto files:
    // prost_build::compile_protos(&["../proto/meshtastic.proto"], &["../proto/"])
    //     .expect("Failed to compile protobuf definitions");
    println!("cargo:rerun-if-changed=../proto/meshtastic.proto");
}
