/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module that encompasses feature-specific logic (primarily async runtime drivers).
 */

#[cfg(feature = "tokio")]
pub mod gneiss_tokio;
