// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fuzz target for archive entry name normalization

#![no_main]

use libfuzzer_sys::fuzz_target;
use stow_core::StoragePath;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(path) = StoragePath::from_archive_entry(&raw) {
        // Whatever survives stays below the extraction root
        let dest = StoragePath::parse("dest/dir").unwrap();
        assert!(dest.join_path(&path).starts_with(&dest));
        assert!(path
            .segments()
            .iter()
            .all(|s| s != ".." && s != "." && !s.is_empty() && !s.contains('/')));
    }
});
