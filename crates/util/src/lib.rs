// SPDX-License-Identifier: AGPL-3.0-only

pub mod id;
pub mod string_atom;
