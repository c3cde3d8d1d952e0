// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! bvm: unattended Windows installation into KVM virtual machines.

use app::App;
use clap::Parser;

pub mod app;
pub mod config;
pub mod cpu;
pub mod domain;
pub mod isopatch;
pub mod mount;
pub mod nbd;
pub mod runner;
pub mod scripts;
pub mod unattend;
pub mod util;
pub mod wim;

#[cfg(not(target_os = "linux"))]
compile_error!("only Linux targets are supported");

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let app = App::parse();
    let interactive = match app.interactive {
        Some(val) => val,
        None => atty::is(atty::Stream::Stdout),
    };

    let script = app.get_script()?;
    runner::run_script(script, interactive)
}
