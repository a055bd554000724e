pub fn main() {
    // Migrations are embedded with `embed_migrations!`, so a changed SQL file
    // must trigger a rebuild of the binary.
    println!("cargo:rerun-if-changed=migrations");
}
