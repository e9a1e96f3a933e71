use walkdir::WalkDir;

fn main() {
    println!("cargo:rerun-if-changed=templates");
    let templates = WalkDir::new("templates")
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file());

    for entry in templates {
        let path = entry.path();
        // an unclosed placeholder would end up on the host verbatim
        let content = std::fs::read_to_string(path).unwrap_or_default();
        if content.matches("{{").count() != content.matches("}}").count() {
            panic!("unbalanced placeholder in {}", path.display());
        }
        println!("cargo:rerun-if-changed={}", path.display());
    }
}
