// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Protocol buffers definitions used on the broker-to-broker channel, and as event
//! payloads.
#![allow(missing_docs)]

tonic::include_proto!("switchyard");

impl HealthCheckResponse {
    pub const fn with_status(status: i32) -> Self {
        Self { status }
    }
}

impl HealthCheckRequest {
    pub fn for_service<S: Into<String>>(service: S) -> Self {
        Self {
            service: service.into(),
        }
    }
}
