use std::fs;
use std::path::Path;

const MAX_WIDTH: usize = 100;

fn collect(dir: &Path, out: &mut Vec<String>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            let text = fs::read_to_string(&path).unwrap();
            for (n, line) in text.lines().enumerate() {
                if line.chars().count() > MAX_WIDTH {
                    out.push(format!("{}:{}", path.display(), n + 1));
                }
            }
        }
    }
}

#[test]
fn sources_stay_within_line_width() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut wide = Vec::new();
    collect(&root.join("src"), &mut wide);
    collect(&root.join("tests"), &mut wide);
    assert!(wide.is_empty(), "lines over {MAX_WIDTH} columns: {wide:#?}");
}
