// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Serde-facing enumerations used by the YAML node configuration.

use serde::{Deserialize, Serialize};

use crate::node::address_book::{AuthType, NvService};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTypeCfg {
    Standard,
    OpenMedia,
}

impl From<AuthTypeCfg> for AuthType {
    fn from(v: AuthTypeCfg) -> Self {
        match v {
            AuthTypeCfg::Standard => AuthType::Standard,
            AuthTypeCfg::OpenMedia => AuthType::OpenMedia,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NvServiceCfg {
    #[default]
    Ackd,
    UnackRpt,
    Unackd,
}

impl From<NvServiceCfg> for NvService {
    fn from(v: NvServiceCfg) -> Self {
        match v {
            NvServiceCfg::Ackd => NvService::Ackd,
            NvServiceCfg::UnackRpt => NvService::UnackRpt,
            NvServiceCfg::Unackd => NvService::Unackd,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NvDirectionCfg {
    #[default]
    Input,
    Output,
}
