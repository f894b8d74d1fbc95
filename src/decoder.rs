// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoder plugins.
//!
//! The container core never decodes coded bitstreams itself. Callers
//! register [`DecoderPlugin`]s with a context; each plugin bids a priority
//! per compression format and the highest positive bid wins, independent of
//! registration order.

use crate::image::Image;
use crate::{Result, TryVec};

/// Compression family of a coded image payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Hevc,
    Avc,
}

/// One decoding session.
///
/// A decoder is acquired per decode call and released when dropped, on all
/// exit paths.
pub trait Decoder {
    /// Feed the coded payload: the length-prefixed parameter-set NAL units
    /// followed by the item's extent bytes.
    fn push_data(&mut self, data: &[u8]) -> Result<()>;

    /// Synchronously produce one decoded frame.
    fn decode_image(&mut self) -> Result<Image>;
}

/// A decoder implementation that can be registered with a context.
pub trait DecoderPlugin {
    /// Priority bid for `format`; 0 means "cannot handle".
    fn does_support_format(&self, format: CompressionFormat) -> u32;

    /// Acquire a fresh decoder instance.
    fn new_decoder(&self) -> Result<Box<dyn Decoder>>;
}

/// The per-context plugin set.
pub(crate) struct DecoderRegistry {
    plugins: TryVec<Box<dyn DecoderPlugin>>,
}

impl DecoderRegistry {
    pub(crate) fn new() -> Self {
        Self {
            plugins: TryVec::new(),
        }
    }

    pub(crate) fn register(&mut self, plugin: Box<dyn DecoderPlugin>) -> Result<()> {
        self.plugins.push(plugin)?;
        Ok(())
    }

    /// The plugin with the highest positive bid for `format`, if any.
    pub(crate) fn best_for(&self, format: CompressionFormat) -> Option<&dyn DecoderPlugin> {
        let mut highest_priority = 0;
        let mut best: Option<&dyn DecoderPlugin> = None;
        for plugin in self.plugins.iter() {
            let priority = plugin.does_support_format(format);
            if priority > highest_priority {
                highest_priority = priority;
                best = Some(plugin.as_ref());
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct Stub {
        priority: u32,
    }

    impl DecoderPlugin for Stub {
        fn does_support_format(&self, format: CompressionFormat) -> u32 {
            match format {
                CompressionFormat::Hevc => self.priority,
                CompressionFormat::Avc => 0,
            }
        }

        fn new_decoder(&self) -> Result<Box<dyn Decoder>> {
            Err(Error::DecoderError("stub"))
        }
    }

    #[test]
    fn highest_bid_wins_regardless_of_order() {
        let mut registry = DecoderRegistry::new();
        registry.register(Box::new(Stub { priority: 10 })).unwrap();
        registry.register(Box::new(Stub { priority: 90 })).unwrap();
        registry.register(Box::new(Stub { priority: 50 })).unwrap();

        let best = registry.best_for(CompressionFormat::Hevc).unwrap();
        assert_eq!(best.does_support_format(CompressionFormat::Hevc), 90);
    }

    #[test]
    fn zero_bid_means_no_decoder() {
        let mut registry = DecoderRegistry::new();
        registry.register(Box::new(Stub { priority: 0 })).unwrap();
        assert!(registry.best_for(CompressionFormat::Hevc).is_none());
        assert!(registry.best_for(CompressionFormat::Avc).is_none());
    }
}
