// SPDX-License-Identifier: Apache-2.0

pub mod exporters;
pub mod init;
pub mod periodic;
pub mod receivers;
pub mod topic_config;
pub mod topics;
pub mod work_queue;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
