// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scripted workflows this tool can run.

pub mod build_installer;
pub mod first_boot;
pub mod patch_iso;
pub mod prepare;
