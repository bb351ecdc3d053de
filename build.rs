use std::fs;
use std::path::Path;

fn main() {
    println!("cargo:rerun-if-changed=src/contracts/hardcoded/");

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let tables_dir = Path::new(&manifest_dir).join("src/contracts/hardcoded");

    let mut modules: Vec<String> = fs::read_dir(&tables_dir)
        .expect("src/contracts/hardcoded/ directory not found")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    modules.sort();

    let content: String = modules
        .iter()
        .map(|m| {
            let table_path = tables_dir.join(m).join("mod.rs");
            format!("#[path = {:?}]\npub(crate) mod {};\n", table_path, m)
        })
        .collect();

    let out_dir = std::env::var("OUT_DIR").unwrap();
    let dest = Path::new(&out_dir).join("contract_tables.rs");
    fs::write(dest, content).unwrap();
}
