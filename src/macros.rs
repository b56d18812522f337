// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Conditionally return from an `-> Option<T>` context based on a boolean expression.
macro_rules! guard {
    ($e:expr) => {{
        if !$e {
            return None;
        }
    }};

    ($e:expr, $v:expr) => {{
        if $e {
            Some($v)
        } else {
            None
        }
    }};
}

/// Implement `Eq`, `Ord` and `Hash` for a type by projecting it onto a key.
///
/// `PartialEq` must be implemented (or derived) consistently by the caller.
macro_rules! derive_cmp_with {
    ($type:ty, $access:ident => $get:expr) => {
        impl Eq for $type {}

        impl PartialOrd for $type {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $type {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                fn access(e: &$type) -> impl Ord + '_ {
                    let $access = e;
                    $get
                }

                access(self).cmp(&access(other))
            }
        }

        impl std::hash::Hash for $type {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                let $access = self;
                $get.hash(state);
            }
        }
    };
}
