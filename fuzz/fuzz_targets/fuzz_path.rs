// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fuzz target for StoragePath and QualifiedPath parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use stow_core::{QualifiedPath, StoragePath};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = QualifiedPath::parse_uri(input);

        if let Ok(path) = StoragePath::parse(input) {
            // Parsing the printed form gives the same path back
            let reparsed = StoragePath::parse(path.to_path_string());
            assert_eq!(reparsed.ok().as_ref(), Some(&path));
            assert!(path.segments().iter().all(|s| s != ".." && !s.is_empty()));

            let _ = path.name();
            let _ = path.extension();
            if let Some(parent) = path.parent() {
                assert!(path.starts_with(&parent));
            }

            if input.len() > 10 {
                if let Ok(joined) = path.join(&input[..10]) {
                    assert!(joined.starts_with(&path));
                }
            }
        }
    }
});
