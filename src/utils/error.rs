// Copyright (c) 2024 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageErr {
    #[error("bad {0} file descriptor")]
    BadDescriptor(&'static str),
    #[error("{0} file descriptor is not a unix socket")]
    NotSocket(&'static str),
    #[error("error while reading {0}")]
    ReadSocket(&'static str),
    #[error("error while writing {0}")]
    WriteSocket(&'static str),
    #[error("Failed to open {0}")]
    OpenFile(String),
    #[error("Failed to spawn {0} thread")]
    SpawnThread(&'static str),
    #[error("Failed to clone {0} process")]
    CloneProcess(&'static str),
    #[error("Failed to write {0} of process {1}")]
    WriteIdMap(&'static str, i32),
    #[error("Failed to get all capabilities of {0} set")]
    GetAllCaps(String),
    #[error("Failed to set the capability set {0}")]
    SetCaps(String),
    #[error("Failed to add architecture to seccomp filter")]
    AddScmpArch,
}
