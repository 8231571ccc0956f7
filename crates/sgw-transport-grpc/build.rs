//! Build script to compile protobuf definitions.

const PROTOS: &[&str] = &[
    "../../proto/routing.proto",
    "../../proto/kv.proto",
    "../../proto/query.proto",
    "../../proto/search.proto",
    "../../proto/analytics.proto",
    "../../proto/admin_bucket.proto",
    "../../proto/admin_collection.proto",
    "../../proto/admin_search.proto",
    "../../proto/admin_query.proto",
    "../../proto/transactions.proto",
    "../../proto/internal_hooks.proto",
    "../../proto/health.proto",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for proto in PROTOS {
        println!("cargo:rerun-if-changed={}", proto);
        tonic_build::compile_protos(proto)?;
    }
    Ok(())
}
