//! Helper functions to disallow absolute paths or relative paths that goes into
//! parent paths.

use std::path::{Component, Path};

/// Checks if a path is a relative path that does not navigate to its parent.
/// Returns `Err` if it's not.
pub fn enforce_child_path(path: &Path) -> Result<(), String> {
    let mut depth = 0;
    for part in path.components() {
        match part {
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!(
                    "Path {} is an absolute path, which is not allowed",
                    path.to_string_lossy()
                ));
            }
            Component::CurDir => {}
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
        }
        if depth < 0 {
            return Err(format!(
                "Path {} navigates into its parents, which is not allowed",
                path.to_string_lossy()
            ));
        }
    }
    Ok(())
}

/// Checks that `name` names an entry directly inside some directory: a single
/// normal component, no separators.
pub fn enforce_plain_file_name(name: &str) -> Result<(), String> {
    let path = Path::new(name);
    enforce_child_path(path)?;
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(format!("{} is not a plain file name", name)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_enforce_relative_path() {
        enforce_child_path("./main.cpp".as_ref()).unwrap();
        enforce_child_path("main.cpp".as_ref()).unwrap();
        enforce_child_path("logs/run1/out.txt".as_ref()).unwrap();
        enforce_child_path("logs/../out.txt".as_ref()).unwrap();
    }

    #[test]
    fn test_enforce_relative_path_fail() {
        enforce_child_path("/etc/passwd".as_ref()).unwrap_err();
        enforce_child_path("../main.cpp".as_ref()).unwrap_err();
        enforce_child_path("logs/../../main.cpp".as_ref()).unwrap_err();
        enforce_child_path("./../lib/main.cpp".as_ref()).unwrap_err();
    }

    #[test]
    fn test_enforce_plain_file_name() {
        enforce_plain_file_name("main.cpp").unwrap();
        enforce_plain_file_name("Makefile").unwrap();
        enforce_plain_file_name("..hidden").unwrap();

        enforce_plain_file_name("").unwrap_err();
        enforce_plain_file_name(".").unwrap_err();
        enforce_plain_file_name("..").unwrap_err();
        enforce_plain_file_name("src/main.cpp").unwrap_err();
        enforce_plain_file_name("/main.cpp").unwrap_err();
    }
}
