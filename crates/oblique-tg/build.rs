fn main() {
    // trigger recompilation when a new migration is added
    println!("cargo:rerun-if-changed=migrations");

    vergen::EmitBuilder::builder()
        .build_timestamp()
        .git_sha(false)
        .cargo_target_triple()
        .cargo_debug()
        .emit()
        .unwrap();
}
