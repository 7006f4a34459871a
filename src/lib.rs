/*
  Copyright© 2022 Raúl Wolters(1)

  This file is part of rustronomy-core.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

#![doc(
  html_logo_url = "https://raw.githubusercontent.com/smups/rustronomy/main/logos/Rustronomy_ferris.png?raw=true"
)]
//! Rustronomy-propagate is a pure-rust implementation of seeded propagation
//! segmentation (see Jones, Carpenter & Golland, 2005[^1]).
//!
//! # Features
//! The crate implements a single, exact segmentation transform: starting from
//! user-supplied seed pixels, region labels are propagated outwards across a
//! 2D intensity field with a multi-source shortest-path search. Propagation
//! from competing seeds stops wherever another front got there at a lower
//! accumulated "distance". The distance metric is a geodesic blend of
//! 1. the local intensity deviation from a per-label *reference intensity*,
//! which makes objects of strongly varying brightness compete fairly, and
//! 2. the plain Euclidean distance travelled across the grid.
//!
//! The blend is controlled by the `lambda` parameter; the intensity term is
//! averaged over a configurable window set by the `radius` parameter.
//!
//! In addition, `rustronomy-propagate` provides extra functionality which can
//! be accessed via cargo feature gates. A list of all additional features
//! [can be found below](#cargo-feature-gates).
//!
//! # Quickstart
//! To use the latest release of Rustronomy-propagate in a cargo project, add
//! the rustronomy-propagate crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! rustronomy-propagate = "0.1.0"
//! ```
//! To use Rustronomy-propagate in a Jupyter notebook, execute a cell
//! containing the following code:
//! ```text
//! :dep rustronomy-propagate = {version = "0.1"}
//! ```
//!
//! ## Short example: segmenting two blobs of very different brightness
//! `rustronomy-propagate` uses the commonly used "builder pattern" to
//! configure the propagation transform before executing it. To configure a
//! transform, create an instance of the `TransformBuilder` struct. Once you
//! are done specifying options for the builder struct using its associated
//! functions, call the `build()` function to generate the transform object,
//! which you can now use to execute the configured transform.
//! ```rust
//! use rustronomy_propagate::prelude::*;
//! use ndarray as nd;
//!
//! //A small image with a bright and a faint object
//! let image = nd::array![
//!   [9.0, 9.0, 1.0, 1.0],
//!   [9.0, 9.0, 1.0, 1.0],
//!   [0.1, 0.1, 1.0, 1.0],
//!   [0.1, 0.1, 1.0, 1.0]
//! ];
//! //Set-up the propagation transform
//! let propagation = TransformBuilder::new().set_lambda(0.05).set_radius(1).build().unwrap();
//! //Seed both objects and normalize each front by its own centre intensity
//! let seeds = [(0, 0), (3, 3)];
//! let labels = propagation.labels_from_seeds(image.dim(), &seeds);
//! let refs = propagation.reference_intensities(image.view(), &seeds, 1);
//! let mask = nd::Array2::from_elem(image.dim(), true);
//! //Execute the propagation transform
//! let segmentation =
//!   propagation.propagate(image.view(), labels.view(), mask.view(), &refs).unwrap();
//! assert_eq!(segmentation.labels[[0, 0]], 1);
//! ```
//! [^1]: T. R. Jones, A. E. Carpenter and P. Golland. **Voronoi-Based
//! Segmentation of Cells on Image Manifolds.** *In Proceedings of the ICCV
//! Workshop on Computer Vision for Biomedical Image Applications (CVBIA)*,
//! October 2005.
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! From the jemalloc website: *"jemalloc is a general purpose `malloc`(3)
//! implementation that emphasizes fragmentation avoidance and scalable concurrency
//! support."*. Jemalloc is enabled though usage of the `jemalloc` crate, which
//! increases compile times considerably. To compile `rustronomy-propagate` with
//! the `jemalloc` feature, jemalloc must be installed on the host system.
//! - `plots`: with this feature enabled, `rustronomy-propagate` will generate
//! a png image of the finished label field. Plotting support adds the
//! `plotters` crate as a dependency, which increases compile times and
//! requires the installation of some packages on linux systems,
//! [see the `plotters` documentation for details](https://docs.rs/plotters/).
//! - `progress`: this feature enables a progress bar for the propagation
//! transform. Enabling this feature adds the `indicatif` crate as a
//! dependency, which should not considerably slow down compile times.
//! - `debug`: this feature enables debug and performance monitoring output.
//! This can negatively impact performance. Enabling this feature does not add
//! additional dependencies.
//!
//! ## `plots` feature gate
//! Enabling the `plots` feature gate adds two new methods to the
//! `TransformBuilder` struct: `set_plot_colour_map`, which can be used to set
//! the colour map that will be used by `plotters` to generate the image and
//! `set_plot_folder`, which can be used to specify the folder where the
//! generated image should be placed. If no output folder is specified when
//! the `plots` feature is enabled, no plot will be generated (code will
//! still compile).
//!
//! The generated plot is a png file with no text. Each pixel in the generated
//! image corresponds 1:1 to a pixel in the input array.

//Unconditional imports
use ndarray as nd;
use num_traits::{Num, ToPrimitive};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

//Progress bar (conditional)
#[cfg(feature = "progress")]
use indicatif;

//Constant for pixels that carry no label (yet)
const BACKGROUND: usize = 0;

//All 8-connected neighbour offsets: the 4-connected ones first, then the
//diagonals
const NEIGHBOURS_8: [(isize, isize); 8] =
  [(-1, 0), (1, 0), (0, -1), (0, 1), (-1, -1), (-1, 1), (1, -1), (1, 1)];

//Utility prelude for batch import
pub mod prelude {
  pub use crate::{
    Propagation, PropagationStats, PropagationUtils, Segmentation, TransformBuilder,
  };
  #[cfg(feature = "plots")]
  pub mod color_maps {
    pub use crate::plotting::grey_scale;
    pub use crate::plotting::label_colours;
  }
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "progress")]
fn set_up_bar(mask_px: u64) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}] finalized {pos}/{len} px{bar:60}";
  let style = indicatif::ProgressStyle::with_template(TEMPLATE);
  let bar = indicatif::ProgressBar::new(mask_px);
  bar.set_style(style.unwrap());
  return bar;
}

#[inline]
fn clamped_fetch(image: nd::ArrayView2<f64>, row: isize, col: isize) -> f64 {
  //Replicate-border policy: out-of-bounds reads yield the nearest edge pixel
  let (m, n) = image.dim();
  let row = row.clamp(0, m as isize - 1) as usize;
  let col = col.clamp(0, n as isize - 1) as usize;
  image[[row, col]]
}

/// average intensity in a window around a pixel
fn average_intensity(image: nd::ArrayView2<f64>, row: usize, col: usize, radius: usize) -> f64 {
  let radius = radius as isize;
  let mut intensity = 0.0;
  for delta_r in -radius..=radius {
    for delta_c in -radius..=radius {
      intensity += clamped_fetch(image, row as isize + delta_r, col as isize + delta_c);
    }
  }
  intensity / (((radius + 1) * (radius + 1)) as f64)
}

/// propagation cost of the step from pixel `from` to pixel `to`
fn difference(
  image: nd::ArrayView2<f64>,
  from: (usize, usize),
  to: (usize, usize),
  radius: usize,
  ref_intensity: f64,
  lambda: f64,
  evaluations: &mut u64,
) -> f64 {
  *evaluations += 1;
  let radius = radius as isize;

  /*Intensity term: mean absolute deviation from the reference intensity,
    sampled in a window around the source pixel and normalized by the
    reference intensity itself. The (radius+1)² divisor is the window-size
    convention of this metric, NOT the full window pixel count.
  */
  let mut pixel_diff = 0.0;
  for delta_r in -radius..=radius {
    for delta_c in -radius..=radius {
      pixel_diff += (clamped_fetch(image, from.0 as isize + delta_r, from.1 as isize + delta_c)
        - ref_intensity)
        .abs();
    }
  }
  pixel_diff /= ((radius + 1) * (radius + 1)) as f64 * ref_intensity;

  //Spatial term: Euclidean distance between the two pixel centres, which
  //makes the accumulated distance 'semi-geodesic'
  let delta_r = from.0 as f64 - to.0 as f64;
  let delta_c = from.1 as f64 - to.1 as f64;
  let space_diff = (delta_r * delta_r + delta_c * delta_c).sqrt();

  //here is space for taking into account gradient images / gradient
  //crossings from the label centre to the new pixel

  (1.0 - lambda) * pixel_diff + lambda * space_diff
}

/// A pending relaxation on the frontier. Entries are totally ordered by
/// (distance, row, column, label) so that ties between equally distant
/// candidates resolve in row-major order, keeping the transform
/// deterministic.
#[derive(Clone, Copy, Debug)]
struct FrontierEntry {
  distance: f64,
  row: usize,
  col: usize,
  label: usize,
}

impl Ord for FrontierEntry {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .distance
      .total_cmp(&other.distance)
      .then(self.row.cmp(&other.row))
      .then(self.col.cmp(&other.col))
      .then(self.label.cmp(&other.label))
  }
}

impl PartialOrd for FrontierEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for FrontierEntry {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for FrontierEntry {}

#[allow(clippy::too_many_arguments)]
fn push_neighbours(
  frontier: &mut BinaryHeap<Reverse<FrontierEntry>>,
  image: nd::ArrayView2<f64>,
  mask: nd::ArrayView2<bool>,
  labels_out: &nd::Array2<usize>,
  from: (usize, usize),
  dist: f64,
  label: usize,
  radius: usize,
  ref_intensity: f64,
  lambda: f64,
  evaluations: &mut u64,
) {
  let (m, n) = image.dim();
  for &(delta_r, delta_c) in NEIGHBOURS_8.iter() {
    let row = from.0 as isize + delta_r;
    let col = from.1 as isize + delta_c;
    if row < 0 || row >= m as isize || col < 0 || col >= n as isize {
      continue;
    }
    let to = (row as usize, col as usize);

    /*Only unlabelled pixels inside the mask are candidates. This filter runs
      at push time: a pixel may still collect several competing entries before
      it is finalized. The surplus entries are discarded as stale when popped.
    */
    if !mask[to] || labels_out[to] != BACKGROUND {
      continue;
    }

    let cost = difference(image, from, to, radius, ref_intensity, lambda, evaluations);
    frontier.push(Reverse(FrontierEntry { distance: dist + cost, row: to.0, col: to.1, label }));
  }
}

////////////////////////////////////////////////////////////////////////////////
//                             OPTIONAL MODULES                               //
////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "debug")]
mod performance_monitoring {

  #[derive(Clone, Debug, Default)]
  pub struct PerfReport {
    pub seeds: usize,
    pub finalized: usize,
    pub pushes: u64,
    pub pops: u64,
    pub init_ms: usize,
    pub search_ms: usize,
    pub total_ms: usize,
  }

  impl PerfReport {
    pub fn stale_pops(&self) -> u64 {
      self.pops - self.finalized as u64
    }
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">---------[Performance Summary]---------")?;
      writeln!(f, ">  Seeded {} px; finalized {} px", self.seeds, self.finalized)?;
      writeln!(
        f,
        ">  Frontier: {} pushes; {} pops ({} stale)",
        self.pushes,
        self.pops,
        self.stale_pops()
      )?;
      writeln!(f, ">  Seeding: {}ms", self.init_ms)?;
      writeln!(f, ">  Propagation: {}ms", self.search_ms)?;
      writeln!(f, ">--------------------------------+ total")?;
      writeln!(f, ">  {}ms", self.total_ms)
    }
  }
}

#[cfg(feature = "plots")]
/// This module contains all the code required to generate images from the
/// finished label field, including the included colour maps.
pub mod plotting {
  use ndarray as nd;
  use num_traits::ToPrimitive;
  use plotters::prelude::*;
  use std::{error::Error, path::Path};

  //Colour for background px
  const BACKGROUND_COL: RGBColor = BLACK;

  pub fn plot_slice<'a, T>(
    slice: nd::ArrayView2<'a, T>,
    file_name: &Path,
    color_map: fn(count: T, min: T, max: T) -> Result<RGBColor, Box<dyn Error>>,
  ) -> Result<(), Box<dyn Error>>
  where
    T: Default + std::fmt::Display + std::cmp::PartialOrd + ToPrimitive + Copy,
  {
    //Get min and max vals of slice
    let min = slice.iter().fold(T::default(), |f: T, x: &T| if *x < f { *x } else { f });
    let max = slice.iter().fold(T::default(), |f: T, x: &T| if *x > f { *x } else { f });

    //Get the size of the slice
    let x_size = slice.shape()[0] as u32;
    let y_size = slice.shape()[1] as u32;

    //Make new fig
    let root = BitMapBackend::new(file_name, (x_size, y_size)).into_drawing_area();
    root.fill(&WHITE)?;

    //make empty drawing area in fig
    let mut chart = ChartBuilder::on(&root).build_cartesian_2d(0..x_size, 0..y_size)?;
    chart.configure_mesh().disable_mesh().disable_axes().draw()?;
    let plotting_area = chart.plotting_area();

    //fill pixels
    for ((x, y), px) in slice.indexed_iter() {
      plotting_area.draw_pixel((x as u32, y as u32), &color_map(*px, min, max)?)?
    }

    //save file
    root.present()?;

    #[cfg(feature = "debug")]
    println!("slice saved as png: {file_name:?}; max:{max:2}, min:{min:2}");
    Ok(())
  }

  #[inline(always)]
  pub fn grey_scale<T>(count: T, min: T, max: T) -> Result<RGBColor, Box<dyn Error>>
  where
    T: std::fmt::Display + std::cmp::PartialOrd + ToPrimitive,
  {
    if count <= min {
      //This is a background pixel, fill it with the background colour
      Ok(BACKGROUND_COL)
    } else {
      //Grayscale value
      let gray = ((255.0f64 * count.to_f64().unwrap() + min.to_f64().unwrap())
        / max.to_f64().unwrap()) as u8;
      Ok(RGBColor(gray, gray, gray))
    }
  }

  #[inline(always)]
  pub fn label_colours<T>(count: T, _min: T, _max: T) -> Result<RGBColor, Box<dyn Error>>
  where
    T: std::fmt::Display + std::cmp::PartialOrd + ToPrimitive,
  {
    let label = count.to_usize().ok_or(format!("label {count} is not a valid colour index"))?;
    if label == 0 {
      //Background pixels stay dark
      Ok(BACKGROUND_COL)
    } else {
      //Multiplicative hash keeps the colours of neighbouring labels apart
      let hash = label.wrapping_mul(2654435761) & 0xFF_FF_FF;
      Ok(RGBColor((hash >> 16) as u8, ((hash >> 8) & 0xFF) as u8, (hash & 0xFF) as u8))
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                          PROPAGATION TRANSFORM                             //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "plots")]
use plotters::prelude::*;

#[derive(Debug, Clone, Default)]
/// Builder for configuring a propagation transform.
///
/// Use the `new()` associated function to start configuring a transform, then
/// pick the metric with `set_lambda` (intensity/spatial trade-off) and
/// `set_radius` (averaging window for the intensity term). Once you have set
/// the desired options, a transform object can be generated with the
/// `build()` associated function.
///
/// Enabling the `plots` feature gate adds two new methods to the
/// `TransformBuilder` struct: `set_plot_colour_map`, which can be used to set
/// the colour map that will be used by `plotters` to generate the image and
/// `set_plot_folder`, which can be used to specify the folder where the
/// generated image should be placed. If no output folder is specified when
/// the `plots` feature is enabled, no plot will be generated (code will
/// still compile).
pub struct TransformBuilder {
  //Plotting options
  #[cfg(feature = "plots")]
  plot_path: Option<std::path::PathBuf>,
  #[cfg(feature = "plots")]
  plot_colour_map: Option<
    fn(count: usize, min: usize, max: usize) -> Result<RGBColor, Box<dyn std::error::Error>>,
  >,

  //Basic transform options
  lambda: f64,
  radius: usize,
}

impl TransformBuilder {
  #[cfg(not(feature = "plots"))]
  /// creates a new `TransformBuilder` with a pure intensity metric
  /// (`lambda = 0`) and a single-pixel averaging window (`radius = 0`)
  pub fn new() -> Self {
    TransformBuilder { lambda: 0.0, radius: 0 }
  }

  #[cfg(feature = "plots")]
  /// creates a new `TransformBuilder` with a pure intensity metric
  /// (`lambda = 0`) and a single-pixel averaging window (`radius = 0`)
  pub fn new() -> Self {
    TransformBuilder {
      plot_path: None,
      plot_colour_map: Some(plotting::label_colours), //default map hashes labels
      lambda: 0.0,
      radius: 0,
    }
  }

  /// Set the trade-off between the intensity term (weight `1 - lambda`) and
  /// the spatial term (weight `lambda`) of the propagation metric. Lambda
  /// must lie in the interval [0, 1].
  pub fn set_lambda(mut self, lambda: f64) -> Self {
    self.lambda = lambda;
    self
  }

  /// Set the radius of the square window used to average the intensity
  /// deviation around a frontier pixel. A radius of 0 samples only the
  /// frontier pixel itself.
  pub fn set_radius(mut self, radius: usize) -> Self {
    self.radius = radius;
    self
  }

  #[cfg(feature = "plots")]
  /// Set a custom colour map to be used by `plotters` when generating an
  /// image of the finished label field.
  pub fn set_plot_colour_map(
    mut self,
    colour_map: fn(
      count: usize,
      min: usize,
      max: usize,
    ) -> Result<RGBColor, Box<dyn std::error::Error>>,
  ) -> Self {
    self.plot_colour_map = Some(colour_map);
    self
  }

  #[cfg(feature = "plots")]
  /// Set output folder for the image generated after the propagation
  /// transform. If no output folder is specified, no image will be
  /// generated, even with the `plots` feature gate enabled.
  pub fn set_plot_folder(mut self, path: &std::path::Path) -> Self {
    self.plot_path = Some(path.to_path_buf());
    self
  }

  #[cfg(feature = "plots")]
  /// Build a `Propagation` from the current builder configuration. This
  /// function may return an `Err` result if the builder was not properly
  /// configured.
  pub fn build(self) -> Result<Propagation, String> {
    //Check that lambda is a valid mixing weight
    if !(0.0..=1.0).contains(&self.lambda) {
      Err(format!("Lambda was set to {}, but must lie in the interval [0, 1].", self.lambda))?
    }

    Ok(Propagation {
      plot_path: self.plot_path,
      plot_colour_map: self.plot_colour_map.ok_or("No colour map to be used for plotting of the propagation transform was specified. This is a library bug.")?,
      lambda: self.lambda,
      radius: self.radius,
    })
  }

  #[cfg(not(feature = "plots"))]
  /// Build a `Propagation` from the current builder configuration. This
  /// function returns an `Err` result if lambda was set outside the
  /// interval [0, 1].
  pub fn build(self) -> Result<Propagation, String> {
    //Check that lambda is a valid mixing weight
    if !(0.0..=1.0).contains(&self.lambda) {
      Err(format!("Lambda was set to {}, but must lie in the interval [0, 1].", self.lambda))?
    }

    Ok(Propagation { lambda: self.lambda, radius: self.radius })
  }
}

/// This trait contains useful functions for preparing images, seeds and
/// reference intensities to be used as input for a propagation transform
pub trait PropagationUtils {
  /// The `pre_processor` function can convert an array of any numeric
  /// data-type `T` into an array of `f64` intensities plus a validity mask.
  /// Special float values (if `T` is a float type) cannot take part in the
  /// propagation: `NaN` and infinities are mapped to a 0.0 intensity with a
  /// `false` mask entry, so the transform simply never enters those pixels.
  fn pre_processor<T, D>(&self, img: nd::ArrayView<T, D>) -> (nd::Array<f64, D>, nd::Array<bool, D>)
  where
    T: Num + Copy + ToPrimitive + PartialOrd,
    D: nd::Dimension,
  {
    let intensities = img.mapv(|x| {
      let float = x.to_f64().unwrap();
      if float.is_finite() {
        float
      } else {
        0.0
      }
    });
    let mask = img.mapv(|x| x.to_f64().unwrap().is_finite());
    (intensities, mask)
  }

  /// builds a seed label field from a list of seed positions. Seeds are
  /// labelled 1..=k in list order; the assignment is deterministic so that
  /// repeated runs on the same input stay bit-identical.
  fn labels_from_seeds(&self, shape: (usize, usize), seeds: &[(usize, usize)]) -> nd::Array2<f64> {
    let mut labels = nd::Array2::<f64>::zeros(shape);
    for (idx, &seed) in seeds.iter().enumerate() {
      labels[seed] = (idx + 1) as f64;
    }
    labels
  }

  /// returns the reference intensity for each seed in the list, computed as
  /// the window-averaged image intensity around the seed position. The k-th
  /// entry of the returned vec belongs to label k+1, matching the label
  /// assignment of `labels_from_seeds`.
  fn reference_intensities(
    &self,
    image: nd::ArrayView2<f64>,
    seeds: &[(usize, usize)],
    radius: usize,
  ) -> Vec<f64> {
    seeds.iter().map(|&(row, col)| average_intensity(image, row, col, radius)).collect()
  }

  /// returns a vec of the positions of all the pixels that have a higher
  /// value than all their 8-way connected neighbours. Useful for generating
  /// seeds on bright compact objects.
  fn find_local_maxima(&self, img: nd::ArrayView2<f64>) -> Vec<(usize, usize)> {
    //Window size and index of center window pixel
    const WINDOW: (usize, usize) = (3, 3);
    const MID: (usize, usize) = (1, 1);

    let mut maxima = Vec::new();
    nd::Zip::indexed(img.windows(WINDOW)).for_each(|idx, window| {
      //Yield only pixels that are higher than their surroundings
      let target_val = window[MID];
      let is_max = NEIGHBOURS_8
        .iter()
        .map(|&(dr, dc)| window[((MID.0 as isize + dr) as usize, (MID.1 as isize + dc) as usize)])
        .all(|val| val < target_val);
      if is_max {
        maxima.push((idx.0 + 1, idx.1 + 1));
      }
    });
    maxima
  }
}

/// Diagnostic counters of a single propagation run. The counters are purely
/// informative: they never influence the transform itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PropagationStats {
  /// number of edge-cost evaluations performed (one per frontier push)
  pub difference_evaluations: u64,
  /// number of frontier extractions, stale entries included
  pub frontier_pops: u64,
}

/// Output of a propagation transform.
#[derive(Clone, Debug)]
pub struct Segmentation {
  /// final label assignment; 0 marks pixels no front ever reached
  pub labels: nd::Array2<usize>,
  /// final accumulated distances; +infinity marks unreached pixels
  pub distances: nd::Array2<f64>,
  /// diagnostic counters of this run
  pub stats: PropagationStats,
}

/// Implementation of the seeded propagation transform.
///
/// See crate-level documentation for a general introduction to the algorithm.
///
/// The transform grows all seeded regions simultaneously with a multi-source
/// shortest-path search: the cheapest pending candidate pixel (lowest
/// accumulated distance to any seed) is finalized first and then offers its
/// own unlabelled neighbours to the frontier. The frontier is a binary
/// min-heap without decrease-key support; superseded entries remain on the
/// heap and are discarded when popped. Ties between equally distant
/// candidates resolve in row-major order, so the transform is fully
/// deterministic.
///
/// # Memory usage
/// The transform allocates two `Array2`s of the same size as the input array
/// (labels and distances) plus the frontier heap, which is bounded by eight
/// entries per finalized pixel. One can count on the memory usage being about
/// ~3x the size of the input array.
///
/// # Output
/// `propagate` returns a [`Segmentation`] holding the final label field, the
/// accumulated distance field and the diagnostic counters of the run. Pixels
/// that no front could reach (no mask-connected path to any seed) keep label
/// 0 and distance +infinity. Seed pixels outside the mask keep their input
/// label but are never expanded, so their distance also stays +infinity.
pub struct Propagation {
  //Plot options
  #[cfg(feature = "plots")]
  plot_path: Option<std::path::PathBuf>,
  #[cfg(feature = "plots")]
  plot_colour_map:
    fn(count: usize, min: usize, max: usize) -> Result<RGBColor, Box<dyn std::error::Error>>,
  lambda: f64,
  radius: usize,
}

impl Propagation {
  /// Returns the propagation segmentation of the input image.
  ///
  /// `labels_in` holds the seeds: 0.0 marks background, any other value must
  /// be an integer label in the range `1..=reference_intensities.len()`.
  /// Seeds with an invalid label abort the whole transform with an `Err`;
  /// no partial output is produced. Pixels with a `false` mask entry are
  /// never propagated into.
  ///
  /// Every reference intensity must be strictly positive and finite, since
  /// the intensity term of the metric divides by it; zero or negative values
  /// are rejected up front instead of silently producing infinite or NaN
  /// distances.
  pub fn propagate(
    &self,
    image: nd::ArrayView2<f64>,
    labels_in: nd::ArrayView2<f64>,
    mask: nd::ArrayView2<bool>,
    reference_intensities: &[f64],
  ) -> Result<Segmentation, String> {
    //(1) validate the input grids and the reference intensity table
    let shape = image.dim();
    if labels_in.dim() != shape {
      Err(format!(
        "Label field has shape {:?}, which does not match the image shape {:?}.",
        labels_in.dim(),
        shape
      ))?
    }
    if mask.dim() != shape {
      Err(format!(
        "Mask has shape {:?}, which does not match the image shape {:?}.",
        mask.dim(),
        shape
      ))?
    }
    if let Some(&bad) = reference_intensities.iter().find(|x| !(x.is_finite() && **x > 0.0)) {
      Err(format!("Reference intensities must be strictly positive and finite, found {bad}."))?
    }
    let nlabel = reference_intensities.len();

    #[cfg(feature = "debug")]
    let mut perf = performance_monitoring::PerfReport::default();
    #[cfg(feature = "debug")]
    let total_start = std::time::Instant::now();

    /*(2) initialize the output grids: distances start at infinity, labels
      start as a copy of the seed field. Every non-zero seed value must be an
      integer from 1 to nlabel; anything else makes the whole computation
      meaningless, so we abort before touching the frontier.
    */
    let mut distances = nd::Array2::<f64>::from_elem(shape, f64::INFINITY);
    let mut labels_out = nd::Array2::<usize>::zeros(shape);
    for ((row, col), &label) in labels_in.indexed_iter() {
      if label == 0.0 {
        continue;
      }
      if !(label.fract() == 0.0 && label >= 1.0 && label <= nlabel as f64) {
        Err(format!(
          "Inconsistent seed label {label} at ({row}, {col}): labels should be integers from 1 to {nlabel}, 0 for background."
        ))?
      }
      labels_out[[row, col]] = label as usize;
    }

    //(3) set-up stats and progress bar
    let mut stats = PropagationStats::default();
    #[cfg(feature = "progress")]
    let bar = set_up_bar(mask.iter().filter(|&&inside| inside).count() as u64);

    /*(4) multi-source seeding: every masked seed pixel starts at distance 0
      and immediately offers its unlabelled neighbours to the frontier. The
      fronts of all seeds then grow in a single interleaved search.
    */
    #[cfg(feature = "debug")]
    let init_start = std::time::Instant::now();

    let mut frontier: BinaryHeap<Reverse<FrontierEntry>> = BinaryHeap::new();
    for ((row, col), &inside) in mask.indexed_iter() {
      if !inside {
        continue;
      }
      let label = labels_out[[row, col]];
      if label == BACKGROUND {
        continue;
      }
      distances[[row, col]] = 0.0;

      #[cfg(feature = "debug")]
      {
        perf.seeds += 1;
      }
      #[cfg(feature = "progress")]
      bar.inc(1);

      push_neighbours(
        &mut frontier,
        image,
        mask,
        &labels_out,
        (row, col),
        0.0,
        label,
        self.radius,
        reference_intensities[label - 1],
        self.lambda,
        &mut stats.difference_evaluations,
      );
    }

    #[cfg(feature = "debug")]
    {
      perf.init_ms = init_start.elapsed().as_millis() as usize;
    }

    /*(5) main loop: repeatedly extract the cheapest pending candidate. An
      entry whose distance no longer undercuts the recorded distance of its
      pixel is stale (a cheaper front already claimed the pixel) and is
      dropped. Otherwise the entry finalizes its pixel: distance and label
      are fixed for good and the pixel's unlabelled neighbours join the
      frontier.
    */
    #[cfg(feature = "debug")]
    let search_start = std::time::Instant::now();

    while let Some(Reverse(entry)) = frontier.pop() {
      stats.frontier_pops += 1;

      let px = (entry.row, entry.col);
      if entry.distance >= distances[px] {
        //stale entry
        continue;
      }
      distances[px] = entry.distance;
      labels_out[px] = entry.label;

      #[cfg(feature = "debug")]
      {
        perf.finalized += 1;
      }
      #[cfg(feature = "progress")]
      bar.inc(1);

      push_neighbours(
        &mut frontier,
        image,
        mask,
        &labels_out,
        px,
        entry.distance,
        entry.label,
        self.radius,
        reference_intensities[entry.label - 1],
        self.lambda,
        &mut stats.difference_evaluations,
      );
    }

    #[cfg(feature = "progress")]
    bar.finish();

    //(6) Plot the finished label field
    #[cfg(feature = "plots")]
    if let Some(ref path) = self.plot_path {
      if let Err(err) = plotting::plot_slice(
        labels_out.view(),
        &path.join("propagation_labels.png"),
        self.plot_colour_map,
      ) {
        println!("Could not make propagation plot. Error: {err}")
      }
    }

    //(7) print performance report
    #[cfg(feature = "debug")]
    {
      perf.search_ms = search_start.elapsed().as_millis() as usize;
      perf.total_ms = total_start.elapsed().as_millis() as usize;
      perf.pushes = stats.difference_evaluations;
      perf.pops = stats.frontier_pops;
      println!("{perf}");
    }

    Ok(Segmentation { labels: labels_out, distances, stats })
  }
}

impl PropagationUtils for Propagation {}
impl PropagationUtils for TransformBuilder {}
