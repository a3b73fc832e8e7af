//! Multiplexer networks
//!
//! A multiplexer maps context to routing logits `[batch, T, height, width]`,
//! one score per pixel per branch. All variants share a u-net skeleton: a
//! stem conv, `R` halving stages that record skip tensors, a bottleneck
//! stack, and `R` expansion stages that fuse the skips back in at doubling
//! resolution.
//!
//! - [`ConvMultiplexer`] - Scores from the pre-switch features alone
//! - [`EmbeddingMultiplexer`] - Also conditioned on an embedding fused at
//!   the bottleneck
//! - [`QueryKeyMultiplexer`] - Scores each branch by comparing its own output
//!   (key) against a shared query derived from the input
//!
//! [`ReferenceImageBranch`] produces the conditioning embedding from a
//! reference image and the patch's centre point.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use burn_switched_core::blocks::{
    ConvGnSilu, ConvOptions, ExpansionBlock, HalvingBlock, MultiConvBlock, SkipFusion,
};

use crate::error::{Result, SwitchError};

/// Group count of the normalized layers in the reduction heads
const HEAD_GROUPS: usize = 4;

/// Context a multiplexer scores
#[derive(Debug, Clone)]
pub struct MultiplexerInput<B: Backend> {
    /// Pre-switch features [batch, channels, height, width]
    pub features: Tensor<B, 4>,
    /// Conditioning embedding at bottleneck resolution
    pub embedding: Option<Tensor<B, 4>>,
    /// Branch stack [batch, T, channels, height, width]
    pub branches: Tensor<B, 5>,
}

/// Stem, halving stages and expansion stages shared by every variant
#[derive(Module, Debug)]
pub struct UNetSkeleton<B: Backend> {
    pub stem: ConvGnSilu<B>,
    pub reductions: Vec<HalvingBlock<B>>,
    pub expansions: Vec<ExpansionBlock<B>>,
}

impl<B: Backend> UNetSkeleton<B> {
    /// # Arguments
    ///
    /// * `input_channels` - Channels fed to the stem
    /// * `base_filters` - Stem output width, doubled by every reduction
    /// * `reductions` - Number of halving stages
    /// * `stem` - Stem conv options
    /// * `fusion` - Skip fusion style of the expansion stages
    pub fn new(
        input_channels: usize,
        base_filters: usize,
        reductions: usize,
        stem: ConvOptions,
        fusion: SkipFusion,
        device: &B::Device,
    ) -> Self {
        let bottleneck = base_filters << reductions;
        Self {
            stem: ConvGnSilu::new(input_channels, base_filters, stem, device),
            reductions: (0..reductions)
                .map(|i| HalvingBlock::new(base_filters << i, device))
                .collect(),
            expansions: (0..reductions)
                .map(|i| ExpansionBlock::new(bottleneck >> i, fusion, device))
                .collect(),
        }
    }

    /// Width at the bottleneck
    pub fn bottleneck_filters(&self, base_filters: usize) -> usize {
        base_filters << self.reductions.len()
    }

    /// Runs the stem and halving stages, returning the bottleneck features
    /// and the skip tensors in recording order
    pub fn encode(&self, x: Tensor<B, 4>) -> Result<(Tensor<B, 4>, Vec<Tensor<B, 4>>)> {
        let [_, _, h, w] = x.dims();
        let factor = 1 << self.reductions.len();
        if h % factor != 0 || w % factor != 0 {
            return Err(SwitchError::IndivisibleInput {
                height: h,
                width: w,
                factor,
            });
        }

        let mut x = self.stem.forward(x);
        let mut skips = Vec::with_capacity(self.reductions.len());
        for block in &self.reductions {
            skips.push(x.clone());
            x = block.forward(x);
        }
        Ok((x, skips))
    }

    /// Runs the expansion stages, consuming skips deepest first
    pub fn decode(&self, x: Tensor<B, 4>, skips: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let mut x = x;
        for (block, skip) in self.expansions.iter().zip(skips.into_iter().rev()) {
            x = block.forward(x, skip);
        }
        x
    }
}

/// A run of convs at bottleneck width
#[derive(Module, Debug)]
pub struct ProcessingStack<B: Backend> {
    pub blocks: Vec<ConvGnSilu<B>>,
}

impl<B: Backend> ProcessingStack<B> {
    pub fn new(filters: usize, depth: usize, options: ConvOptions, device: &B::Device) -> Self {
        Self {
            blocks: (0..depth)
                .map(|_| ConvGnSilu::new(filters, filters, options, device))
                .collect(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }
}

/// Bottleneck stack that concatenates a processed embedding onto the
/// features and narrows back to bottleneck width
#[derive(Module, Debug)]
pub struct EmbeddingFusion<B: Backend> {
    pub blocks: Vec<ConvGnSilu<B>>,
}

impl<B: Backend> EmbeddingFusion<B> {
    pub fn new(filters: usize, embedding_channels: usize, device: &B::Device) -> Result<Self> {
        let wide = filters + embedding_channels;
        let mid = filters + embedding_channels / 2;
        for width in [filters, mid] {
            if width % burn_switched_core::blocks::DEFAULT_NUM_GROUPS != 0 {
                return Err(SwitchError::InvalidConfig(format!(
                    "embedding fusion width {width} is not divisible into norm groups"
                )));
            }
        }

        let base = ConvOptions::default();
        Ok(Self {
            blocks: vec![
                ConvGnSilu::new(wide, wide, base.kernel(1).norm(false), device),
                ConvGnSilu::new(wide, mid, base.kernel(1).bias(false), device),
                ConvGnSilu::new(mid, filters, base.bias(false), device),
                ConvGnSilu::new(filters, filters, base.bias(false), device),
            ],
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>, embedding: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [_, _, h, w] = x.dims();
        let [_, _, eh, ew] = embedding.dims();
        if [eh, ew] != [h, w] {
            return Err(SwitchError::EmbeddingShape {
                expected: [h, w],
                actual: [eh, ew],
            });
        }

        let mut x = Tensor::cat(vec![x, embedding], 1);
        for block in &self.blocks {
            x = block.forward(x);
        }
        Ok(x)
    }
}

/// Three-stage head mapping `base_filters` down to `branch_count` logits
///
/// Intermediate widths are rounded down to multiples of the head's group
/// count so they can be group-normalized.
#[derive(Module, Debug)]
pub struct ReductionHead<B: Backend> {
    pub cbl1: ConvGnSilu<B>,
    pub cbl2: ConvGnSilu<B>,
    pub cbl3: ConvGnSilu<B>,
}

impl<B: Backend> ReductionHead<B> {
    /// Intermediate head widths for `base_filters` -> `branch_count`
    pub fn widths(base_filters: usize, branch_count: usize) -> Result<(usize, usize)> {
        let base = base_filters as isize;
        let gap = base - branch_count as isize;
        let round = |v: isize| (v / HEAD_GROUPS as isize) * HEAD_GROUPS as isize;
        let cbl1 = round(base - gap / 2);
        let cbl2 = round(base - 3 * gap / 4);
        if cbl1 <= 0 || cbl2 <= 0 {
            return Err(SwitchError::InvalidConfig(format!(
                "multiplexer width {base_filters} is too narrow for {branch_count} branches"
            )));
        }
        Ok((cbl1 as usize, cbl2 as usize))
    }

    pub fn new(base_filters: usize, branch_count: usize, norm: bool, device: &B::Device) -> Result<Self> {
        let (cbl1, cbl2) = Self::widths(base_filters, branch_count)?;
        let hidden = ConvOptions::default().norm(norm).bias(false).groups(HEAD_GROUPS);
        Ok(Self {
            cbl1: ConvGnSilu::new(base_filters, cbl1, hidden, device),
            cbl2: ConvGnSilu::new(cbl1, cbl2, hidden, device),
            cbl3: ConvGnSilu::new(cbl2, branch_count, ConvOptions::default().norm(false), device),
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.cbl3.forward(self.cbl2.forward(self.cbl1.forward(x)))
    }
}

/// U-net multiplexer conditioned only on the pre-switch features
///
/// With `feed_transforms` the flattened branch stack is concatenated onto
/// the features before the stem.
#[derive(Module, Debug)]
pub struct ConvMultiplexer<B: Backend> {
    pub skeleton: UNetSkeleton<B>,
    pub processing: ProcessingStack<B>,
    pub head: ReductionHead<B>,
    pub branch_count: usize,
    pub feed_transforms: bool,
}

impl<B: Backend> ConvMultiplexer<B> {
    pub fn forward(&self, input: MultiplexerInput<B>) -> Result<Tensor<B, 4>> {
        let x = if self.feed_transforms {
            let [b, t, c, h, w] = input.branches.dims();
            let flat = input.branches.reshape([b, t * c, h, w]);
            Tensor::cat(vec![input.features, flat], 1)
        } else {
            input.features
        };

        let (x, skips) = self.skeleton.encode(x)?;
        let x = self.processing.forward(x);
        let x = self.skeleton.decode(x, skips);
        Ok(self.head.forward(x))
    }
}

/// U-net multiplexer that fuses an external embedding at the bottleneck
///
/// The embedding must already have the bottleneck's spatial size
/// (input size divided by `2^reductions`).
#[derive(Module, Debug)]
pub struct EmbeddingMultiplexer<B: Backend> {
    pub embedding_process: MultiConvBlock<B>,
    pub skeleton: UNetSkeleton<B>,
    pub fusion: EmbeddingFusion<B>,
    pub head: ReductionHead<B>,
    pub branch_count: usize,
}

impl<B: Backend> EmbeddingMultiplexer<B> {
    pub fn forward(&self, input: MultiplexerInput<B>) -> Result<Tensor<B, 4>> {
        let embedding = input.embedding.ok_or(SwitchError::MissingEmbedding)?;
        let embedding = self.embedding_process.forward(embedding);

        let (x, skips) = self.skeleton.encode(input.features)?;
        let x = self.fusion.forward(x, embedding)?;
        let x = self.skeleton.decode(x, skips);
        Ok(self.head.forward(x))
    }
}

/// How a query/key multiplexer processes its bottleneck
#[derive(Module, Debug)]
pub enum QueryBottleneck<B: Backend> {
    Plain(ProcessingStack<B>),
    Embedding(QueryEmbedding<B>),
}

/// Embedding projection plus fusion stack for the query path
#[derive(Module, Debug)]
pub struct QueryEmbedding<B: Backend> {
    pub project: ConvGnSilu<B>,
    pub fusion: EmbeddingFusion<B>,
}

/// Multiplexer scoring each branch by how its output relates to a shared
/// query
///
/// The query comes from the u-net skeleton over the pre-switch features.
/// Each branch output is projected to a key by a 1x1 conv; query and key
/// are concatenated per branch and reduced to one logit. Branches are
/// scored independently, so permuting the branch stack permutes the logits
/// the same way.
///
/// The pyramid topology combines query and key with a 3x3 conv followed by
/// an extra normalized 3x3 conv, so each logit also sees its neighbourhood.
#[derive(Module, Debug)]
pub struct QueryKeyMultiplexer<B: Backend> {
    pub skeleton: UNetSkeleton<B>,
    pub bottleneck: QueryBottleneck<B>,
    pub key_process: ConvGnSilu<B>,
    pub query_key_combine: ConvGnSilu<B>,
    /// Normalized 3x3 stage of the pyramid topology
    pub cbl0: Option<ConvGnSilu<B>>,
    pub cbl1: ConvGnSilu<B>,
    pub cbl2: ConvGnSilu<B>,
    pub branch_count: usize,
}

impl<B: Backend> QueryKeyMultiplexer<B> {
    fn query(&self, features: Tensor<B, 4>, embedding: Option<Tensor<B, 4>>) -> Result<Tensor<B, 4>> {
        let (q, skips) = self.skeleton.encode(features)?;
        let q = match &self.bottleneck {
            QueryBottleneck::Plain(stack) => stack.forward(q),
            QueryBottleneck::Embedding(fused) => {
                let embedding = embedding.ok_or(SwitchError::MissingEmbedding)?;
                fused.fusion.forward(q, fused.project.forward(embedding))?
            }
        };
        Ok(self.skeleton.decode(q, skips))
    }

    pub fn forward(&self, input: MultiplexerInput<B>) -> Result<Tensor<B, 4>> {
        let q = self.query(input.features, input.embedding)?;

        let [b, t, f, h, w] = input.branches.dims();
        let k = self.key_process.forward(input.branches.reshape([b * t, f, h, w]));

        let q = q
            .reshape([b, 1, f, h, w])
            .repeat_dim(1, t)
            .reshape([b * t, f, h, w]);

        let mut v = self.query_key_combine.forward(Tensor::cat(vec![q, k], 1));
        if let Some(cbl0) = &self.cbl0 {
            v = cbl0.forward(v);
        }
        let v = self.cbl2.forward(self.cbl1.forward(v));

        Ok(v.reshape([b, t, h, w]))
    }
}

/// One of the multiplexer variants, chosen at construction
#[derive(Module, Debug)]
pub enum Multiplexer<B: Backend> {
    Plain(ConvMultiplexer<B>),
    Embedding(EmbeddingMultiplexer<B>),
    QueryKey(QueryKeyMultiplexer<B>),
}

impl<B: Backend> Multiplexer<B> {
    /// Number of logits produced per pixel
    pub fn branch_count(&self) -> usize {
        match self {
            Multiplexer::Plain(m) => m.branch_count,
            Multiplexer::Embedding(m) => m.branch_count,
            Multiplexer::QueryKey(m) => m.branch_count,
        }
    }

    /// Routing logits `[batch, T, height, width]`
    pub fn produce_logits(&self, input: MultiplexerInput<B>) -> Result<Tensor<B, 4>> {
        match self {
            Multiplexer::Plain(m) => m.forward(input),
            Multiplexer::Embedding(m) => m.forward(input),
            Multiplexer::QueryKey(m) => m.forward(input),
        }
    }
}

/// Picks one feature vector per batch item
///
/// `input` is `[batch, channels, height, width]` and `index` holds one
/// `(row, column)` pair per item, `[batch, 2]`. Returns `[batch, channels]`.
pub fn gather_2d<B: Backend>(input: Tensor<B, 4>, index: Tensor<B, 2, Int>) -> Result<Tensor<B, 2>> {
    let [b, c, h, w] = input.dims();
    let [ib, coords] = index.dims();
    if ib != b || coords != 2 {
        return Err(SwitchError::GatherIndex {
            batch: b,
            actual: [ib, coords],
        });
    }

    let rows = index.clone().slice([0..b, 0..1]);
    let cols = index.slice([0..b, 1..2]);
    let flat = (rows.mul_scalar(w as i64) + cols)
        .unsqueeze_dim::<3>(1)
        .repeat_dim(1, c);

    Ok(input.reshape([b, c, h * w]).gather(2, flat).reshape([b, c]))
}

/// Input channels of a reference image: RGB plus a patch mask
pub const REFERENCE_CHANNELS: usize = 4;

/// Halving stages in [`ReferenceImageBranch`]
const REFERENCE_REDUCTIONS: usize = 3;

/// Encodes a reference image into a latent taken at the patch centre
///
/// A 7x7 stem, three halving stages each followed by a normalized conv,
/// and one more normalized conv. The output width is `8 * base_filters`.
#[derive(Module, Debug)]
pub struct ReferenceImageBranch<B: Backend> {
    pub stem: ConvGnSilu<B>,
    pub reductions: Vec<HalvingBlock<B>>,
    pub refines: Vec<ConvGnSilu<B>>,
    pub tail: ConvGnSilu<B>,
}

impl<B: Backend> ReferenceImageBranch<B> {
    pub fn new(base_filters: usize, device: &B::Device) -> Result<Self> {
        check_groups(base_filters, REFERENCE_REDUCTIONS)?;
        let normed = ConvOptions::default().bias(false);
        let out = base_filters << REFERENCE_REDUCTIONS;
        Ok(Self {
            stem: ConvGnSilu::new(REFERENCE_CHANNELS, base_filters, ConvOptions::default().kernel(7), device),
            reductions: (0..REFERENCE_REDUCTIONS)
                .map(|i| HalvingBlock::new(base_filters << i, device))
                .collect(),
            refines: (1..=REFERENCE_REDUCTIONS)
                .map(|i| ConvGnSilu::new(base_filters << i, base_filters << i, normed, device))
                .collect(),
            tail: ConvGnSilu::new(out, out, normed, device),
        })
    }

    /// Width of the latent
    pub fn output_channels(&self) -> usize {
        self.tail.conv.weight.dims()[0]
    }

    /// Latent `[batch, 8 * base_filters]` at `center_points`
    ///
    /// # Arguments
    ///
    /// * `x` - Reference image `[batch, 4, height, width]`, sides divisible by 8
    /// * `center_points` - Patch centre `(row, column)` in reference pixels, `[batch, 2]`
    pub fn forward(&self, x: Tensor<B, 4>, center_points: Tensor<B, 2, Int>) -> Result<Tensor<B, 2>> {
        let [_, _, h, w] = x.dims();
        let factor = 1 << REFERENCE_REDUCTIONS;
        if h % factor != 0 || w % factor != 0 {
            return Err(SwitchError::IndivisibleInput {
                height: h,
                width: w,
                factor,
            });
        }

        let mut x = self.stem.forward(x);
        for (halve, refine) in self.reductions.iter().zip(&self.refines) {
            x = refine.forward(halve.forward(x));
        }
        let x = self.tail.forward(x);
        gather_2d(x, center_points.div_scalar(factor as i64))
    }

    /// The latent broadcast over a `[height, width]` bottleneck, ready to
    /// condition an embedding multiplexer
    pub fn embedding(
        &self,
        x: Tensor<B, 4>,
        center_points: Tensor<B, 2, Int>,
        bottleneck: [usize; 2],
    ) -> Result<Tensor<B, 4>> {
        let latent = self.forward(x, center_points)?;
        let [b, c] = latent.dims();
        let [h, w] = bottleneck;
        Ok(latent.reshape([b, c, 1, 1]).repeat_dim(2, h).repeat_dim(3, w))
    }
}

/// Multiplexer topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MultiplexerConfig {
    Plain {
        /// Channels of the pre-switch features
        input_channels: usize,
        /// Stem width
        base_filters: usize,
        reductions: usize,
        processing_depth: usize,
        branch_count: usize,
        #[serde(default)]
        fusion: SkipFusion,
        /// Concatenate the branch stack onto the input; branches are
        /// assumed to have `input_channels` channels
        #[serde(default)]
        feed_transforms: bool,
    },
    Embedding {
        filters: usize,
        branch_count: usize,
        #[serde(default = "default_reductions")]
        reductions: usize,
        #[serde(default = "default_embedding_channels")]
        embedding_channels: usize,
    },
    QueryKey {
        filters: usize,
        branch_count: usize,
        #[serde(default = "default_reductions")]
        reductions: usize,
        #[serde(default)]
        embedding_channels: Option<usize>,
        /// 3x3 query/key combine plus a normalized 3x3 stage; no embedding
        #[serde(default)]
        pyramid: bool,
    },
}

fn default_reductions() -> usize {
    2
}

fn default_embedding_channels() -> usize {
    256
}

impl MultiplexerConfig {
    pub fn branch_count(&self) -> usize {
        match self {
            MultiplexerConfig::Plain { branch_count, .. }
            | MultiplexerConfig::Embedding { branch_count, .. }
            | MultiplexerConfig::QueryKey { branch_count, .. } => *branch_count,
        }
    }

    /// Whether the multiplexer reads the branch stack
    pub fn reads_branches(&self) -> bool {
        match self {
            MultiplexerConfig::Plain { feed_transforms, .. } => *feed_transforms,
            MultiplexerConfig::Embedding { .. } => false,
            MultiplexerConfig::QueryKey { .. } => true,
        }
    }

    /// Builds the multiplexer, validating that every normalized layer can
    /// be split into its groups
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Multiplexer<B>> {
        match self {
            MultiplexerConfig::Plain {
                input_channels,
                base_filters,
                reductions,
                processing_depth,
                branch_count,
                fusion,
                feed_transforms,
            } => {
                let stem_in = if *feed_transforms {
                    input_channels * (1 + branch_count)
                } else {
                    *input_channels
                };
                check_groups(*base_filters, *reductions)?;
                let skeleton = UNetSkeleton::new(
                    stem_in,
                    *base_filters,
                    *reductions,
                    ConvOptions::default(),
                    *fusion,
                    device,
                );
                let bottleneck = skeleton.bottleneck_filters(*base_filters);
                Ok(Multiplexer::Plain(ConvMultiplexer {
                    skeleton,
                    processing: ProcessingStack::new(
                        bottleneck,
                        *processing_depth,
                        ConvOptions::default().bias(false),
                        device,
                    ),
                    head: ReductionHead::new(*base_filters, *branch_count, true, device)?,
                    branch_count: *branch_count,
                    feed_transforms: *feed_transforms,
                }))
            }
            MultiplexerConfig::Embedding {
                filters,
                branch_count,
                reductions,
                embedding_channels,
            } => {
                check_groups(*filters, *reductions)?;
                let ec = *embedding_channels;
                if ec == 0 || ec % burn_switched_core::blocks::DEFAULT_NUM_GROUPS != 0 {
                    return Err(SwitchError::InvalidConfig(format!(
                        "embedding width {ec} is not divisible into norm groups"
                    )));
                }
                let skeleton = UNetSkeleton::new(
                    *filters,
                    *filters,
                    *reductions,
                    ConvOptions::default().norm(false),
                    SkipFusion::Wide,
                    device,
                );
                let bottleneck = skeleton.bottleneck_filters(*filters);
                Ok(Multiplexer::Embedding(EmbeddingMultiplexer {
                    embedding_process: MultiConvBlock::new(ec, ec, ec, &[3, 3, 3], true, 1.0, device),
                    skeleton,
                    fusion: EmbeddingFusion::new(bottleneck, ec, device)?,
                    head: ReductionHead::new(*filters, *branch_count, true, device)?,
                    branch_count: *branch_count,
                }))
            }
            MultiplexerConfig::QueryKey {
                filters,
                branch_count,
                reductions,
                embedding_channels,
                pyramid,
            } => {
                check_groups(*filters, *reductions)?;
                if *pyramid && embedding_channels.is_some() {
                    return Err(SwitchError::InvalidConfig(
                        "pyramid query/key multiplexer takes no embedding".into(),
                    ));
                }
                let half = filters / 2;
                if half == 0 || half % HEAD_GROUPS != 0 {
                    return Err(SwitchError::InvalidConfig(format!(
                        "query/key width {filters} must be a positive multiple of {}",
                        HEAD_GROUPS * 2
                    )));
                }

                let skeleton = UNetSkeleton::new(
                    *filters,
                    *filters,
                    *reductions,
                    ConvOptions::default().norm(false),
                    SkipFusion::Wide,
                    device,
                );
                let bottleneck_filters = skeleton.bottleneck_filters(*filters);
                let bottleneck = match embedding_channels {
                    Some(ec) => QueryBottleneck::Embedding(QueryEmbedding {
                        project: ConvGnSilu::new(*ec, *ec, ConvOptions::default().norm(false), device),
                        fusion: EmbeddingFusion::new(bottleneck_filters, *ec, device)?,
                    }),
                    None => QueryBottleneck::Plain(ProcessingStack::new(
                        bottleneck_filters,
                        3,
                        ConvOptions::default().kernel(1).bias(false),
                        device,
                    )),
                };

                let pointwise = ConvOptions::default().kernel(1);
                let combine_kernel = if *pyramid { 3 } else { 1 };
                Ok(Multiplexer::QueryKey(QueryKeyMultiplexer {
                    skeleton,
                    bottleneck,
                    key_process: ConvGnSilu::new(*filters, *filters, pointwise.norm(false), device),
                    query_key_combine: ConvGnSilu::new(
                        filters * 2,
                        *filters,
                        ConvOptions::default().kernel(combine_kernel).norm(false).bias(false),
                        device,
                    ),
                    cbl0: pyramid.then(|| {
                        ConvGnSilu::new(*filters, *filters, ConvOptions::default().bias(false), device)
                    }),
                    cbl1: ConvGnSilu::new(
                        *filters,
                        half,
                        pointwise.bias(false).groups(HEAD_GROUPS),
                        device,
                    ),
                    cbl2: ConvGnSilu::new(half, 1, pointwise.norm(false).bias(false), device),
                    branch_count: *branch_count,
                }))
            }
        }
    }
}

/// Every skeleton stage is group-normalized with the default group count
fn check_groups(base_filters: usize, reductions: usize) -> Result<()> {
    let groups = burn_switched_core::blocks::DEFAULT_NUM_GROUPS;
    if base_filters == 0 || base_filters % groups != 0 {
        return Err(SwitchError::InvalidConfig(format!(
            "multiplexer width {base_filters} must be a positive multiple of {groups}"
        )));
    }
    if reductions == 0 {
        return Err(SwitchError::InvalidConfig(
            "multiplexer needs at least one reduction".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn branches(b: usize, t: usize, c: usize, hw: usize) -> Tensor<TestBackend, 5> {
        Tensor::random([b, t, c, hw, hw], Distribution::Normal(0.0, 1.0), &Default::default())
    }

    fn features(b: usize, c: usize, hw: usize) -> Tensor<TestBackend, 4> {
        Tensor::random([b, c, hw, hw], Distribution::Normal(0.0, 1.0), &Default::default())
    }

    #[test]
    fn test_head_widths_are_group_multiples() {
        assert_eq!(ReductionHead::<TestBackend>::widths(16, 4).unwrap(), (8, 4));
        assert_eq!(ReductionHead::<TestBackend>::widths(64, 8).unwrap(), (36, 20));

        let (a, b) = ReductionHead::<TestBackend>::widths(48, 6).unwrap();
        assert_eq!(a % HEAD_GROUPS, 0);
        assert_eq!(b % HEAD_GROUPS, 0);

        assert!(ReductionHead::<TestBackend>::widths(2, 4).is_err());
    }

    #[test]
    fn test_plain_multiplexer_logit_shape() {
        let device = Default::default();
        let config = MultiplexerConfig::Plain {
            input_channels: 16,
            base_filters: 16,
            reductions: 2,
            processing_depth: 2,
            branch_count: 4,
            fusion: SkipFusion::Concat,
            feed_transforms: false,
        };
        let mux = config.init::<TestBackend>(&device).unwrap();
        assert_eq!(mux.branch_count(), 4);

        let logits = mux
            .produce_logits(MultiplexerInput {
                features: features(2, 16, 16),
                embedding: None,
                branches: branches(2, 4, 16, 16),
            })
            .unwrap();
        assert_eq!(logits.dims(), [2, 4, 16, 16]);
    }

    #[test]
    fn test_plain_multiplexer_reads_branch_stack() {
        let device = Default::default();
        let config = MultiplexerConfig::Plain {
            input_channels: 8,
            base_filters: 16,
            reductions: 1,
            processing_depth: 1,
            branch_count: 3,
            fusion: SkipFusion::Wide,
            feed_transforms: true,
        };
        assert!(config.reads_branches());
        let mux = config.init::<TestBackend>(&device).unwrap();

        let logits = mux
            .produce_logits(MultiplexerInput {
                features: features(1, 8, 8),
                embedding: None,
                branches: branches(1, 3, 8, 8),
            })
            .unwrap();
        assert_eq!(logits.dims(), [1, 3, 8, 8]);
    }

    #[test]
    fn test_plain_multiplexer_rejects_indivisible_input() {
        let device = Default::default();
        let config = MultiplexerConfig::Plain {
            input_channels: 8,
            base_filters: 8,
            reductions: 2,
            processing_depth: 1,
            branch_count: 2,
            fusion: SkipFusion::Concat,
            feed_transforms: false,
        };
        let mux = config.init::<TestBackend>(&device).unwrap();
        let result = mux.produce_logits(MultiplexerInput {
            features: features(1, 8, 10),
            embedding: None,
            branches: branches(1, 2, 8, 10),
        });
        assert!(matches!(result, Err(SwitchError::IndivisibleInput { factor: 4, .. })));
    }

    #[test]
    fn test_embedding_multiplexer_requires_matching_embedding() {
        let device = Default::default();
        let config = MultiplexerConfig::Embedding {
            filters: 16,
            branch_count: 4,
            reductions: 2,
            embedding_channels: 32,
        };
        let mux = config.init::<TestBackend>(&device).unwrap();

        let missing = mux.produce_logits(MultiplexerInput {
            features: features(1, 16, 16),
            embedding: None,
            branches: branches(1, 4, 16, 16),
        });
        assert!(matches!(missing, Err(SwitchError::MissingEmbedding)));

        let wrong = mux.produce_logits(MultiplexerInput {
            features: features(1, 16, 16),
            embedding: Some(features(1, 32, 8)),
            branches: branches(1, 4, 16, 16),
        });
        assert!(matches!(
            wrong,
            Err(SwitchError::EmbeddingShape {
                expected: [4, 4],
                actual: [8, 8]
            })
        ));

        let logits = mux
            .produce_logits(MultiplexerInput {
                features: features(1, 16, 16),
                embedding: Some(features(1, 32, 4)),
                branches: branches(1, 4, 16, 16),
            })
            .unwrap();
        assert_eq!(logits.dims(), [1, 4, 16, 16]);
    }

    #[test]
    fn test_query_key_shapes_with_and_without_embedding() {
        let device = Default::default();
        for embedding_channels in [None, Some(16)] {
            let config = MultiplexerConfig::QueryKey {
                filters: 16,
                branch_count: 3,
                reductions: 2,
                embedding_channels,
                pyramid: false,
            };
            let mux = config.init::<TestBackend>(&device).unwrap();
            let logits = mux
                .produce_logits(MultiplexerInput {
                    features: features(2, 16, 8),
                    embedding: embedding_channels.map(|ec| features(2, ec, 2)),
                    branches: branches(2, 3, 16, 8),
                })
                .unwrap();
            assert_eq!(logits.dims(), [2, 3, 8, 8]);
        }
    }

    #[test]
    fn test_query_key_is_branch_permutation_equivariant() {
        let device = Default::default();
        let config = MultiplexerConfig::QueryKey {
            filters: 8,
            branch_count: 3,
            reductions: 1,
            embedding_channels: None,
            pyramid: false,
        };
        let mux = config.init::<TestBackend>(&device).unwrap();

        let x = features(1, 8, 8);
        let stack = branches(1, 3, 8, 8);
        let permutation = [2usize, 0, 1];

        let permuted = Tensor::cat(
            permutation
                .iter()
                .map(|&i| stack.clone().slice([0..1, i..i + 1, 0..8, 0..8, 0..8]))
                .collect(),
            1,
        );

        let logits = mux
            .produce_logits(MultiplexerInput {
                features: x.clone(),
                embedding: None,
                branches: stack,
            })
            .unwrap();
        let permuted_logits = mux
            .produce_logits(MultiplexerInput {
                features: x,
                embedding: None,
                branches: permuted,
            })
            .unwrap();

        for (slot, &source) in permutation.iter().enumerate() {
            let expected: Vec<f32> = logits
                .clone()
                .slice([0..1, source..source + 1, 0..8, 0..8])
                .into_data()
                .to_vec()
                .unwrap();
            let actual: Vec<f32> = permuted_logits
                .clone()
                .slice([0..1, slot..slot + 1, 0..8, 0..8])
                .into_data()
                .to_vec()
                .unwrap();
            for (e, a) in expected.iter().zip(&actual) {
                assert!((e - a).abs() < 1e-4, "slot {slot}: expected {e}, got {a}");
            }
        }
    }

    #[test]
    fn test_pyramid_query_key_topology() {
        let device = Default::default();
        let config = MultiplexerConfig::QueryKey {
            filters: 16,
            branch_count: 3,
            reductions: 3,
            embedding_channels: None,
            pyramid: true,
        };
        let mux = config.init::<TestBackend>(&device).unwrap();
        let Multiplexer::QueryKey(inner) = &mux else {
            panic!("expected a query/key multiplexer");
        };
        assert!(inner.cbl0.is_some());
        assert_eq!(inner.query_key_combine.conv.weight.dims(), [16, 32, 3, 3]);

        let logits = mux
            .produce_logits(MultiplexerInput {
                features: features(2, 16, 16),
                embedding: None,
                branches: branches(2, 3, 16, 16),
            })
            .unwrap();
        assert_eq!(logits.dims(), [2, 3, 16, 16]);

        let with_embedding = MultiplexerConfig::QueryKey {
            filters: 16,
            branch_count: 3,
            reductions: 3,
            embedding_channels: Some(16),
            pyramid: true,
        };
        assert!(matches!(
            with_embedding.init::<TestBackend>(&device),
            Err(SwitchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_gather_2d_picks_one_vector_per_item() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 1, Int>::arange(0..64, &device)
            .float()
            .reshape([2, 2, 4, 4]);
        let index = Tensor::<TestBackend, 2, Int>::from_ints([[1, 2], [3, 0]], &device);

        let picked: Vec<f32> = gather_2d(input.clone(), index).unwrap().into_data().to_vec().unwrap();
        assert_eq!(picked, vec![6.0, 22.0, 44.0, 60.0]);

        let bad = Tensor::<TestBackend, 2, Int>::from_ints([[1, 2]], &device);
        assert!(matches!(
            gather_2d(input, bad),
            Err(SwitchError::GatherIndex { batch: 2, actual: [1, 2] })
        ));
    }

    #[test]
    fn test_reference_branch_conditions_embedding_multiplexer() {
        let device = Default::default();
        let reference = ReferenceImageBranch::<TestBackend>::new(8, &device).unwrap();
        assert_eq!(reference.output_channels(), 64);

        let image = features(2, REFERENCE_CHANNELS, 32);
        let centers = Tensor::<TestBackend, 2, Int>::from_ints([[16, 16], [31, 0]], &device);
        let latent = reference.forward(image.clone(), centers.clone()).unwrap();
        assert_eq!(latent.dims(), [2, 64]);

        let embedding = reference.embedding(image, centers, [4, 4]).unwrap();
        assert_eq!(embedding.dims(), [2, 64, 4, 4]);

        let mux = MultiplexerConfig::Embedding {
            filters: 16,
            branch_count: 4,
            reductions: 2,
            embedding_channels: 64,
        }
        .init::<TestBackend>(&device)
        .unwrap();
        let logits = mux
            .produce_logits(MultiplexerInput {
                features: features(2, 16, 16),
                embedding: Some(embedding),
                branches: branches(2, 4, 16, 16),
            })
            .unwrap();
        assert_eq!(logits.dims(), [2, 4, 16, 16]);

        assert!(matches!(
            reference.forward(features(1, REFERENCE_CHANNELS, 20), Tensor::from_ints([[0, 0]], &device)),
            Err(SwitchError::IndivisibleInput { factor: 8, .. })
        ));
    }

    #[test]
    fn test_config_rejects_ungroupable_widths() {
        let device = Default::default();
        let plain = MultiplexerConfig::Plain {
            input_channels: 8,
            base_filters: 12,
            reductions: 1,
            processing_depth: 1,
            branch_count: 2,
            fusion: SkipFusion::Concat,
            feed_transforms: false,
        };
        assert!(plain.init::<TestBackend>(&device).is_err());

        let query_key = MultiplexerConfig::QueryKey {
            filters: 4,
            branch_count: 2,
            reductions: 1,
            embedding_channels: None,
            pyramid: false,
        };
        assert!(query_key.init::<TestBackend>(&device).is_err());
    }

    #[test]
    fn test_config_deserializes_tagged() {
        let config: MultiplexerConfig = serde_json::from_str(
            r#"{"kind": "query_key", "filters": 32, "branch_count": 8}"#,
        )
        .unwrap();
        assert_eq!(
            config,
            MultiplexerConfig::QueryKey {
                filters: 32,
                branch_count: 8,
                reductions: 2,
                embedding_channels: None,
                pyramid: false,
            }
        );
        assert!(config.reads_branches());
    }
}
