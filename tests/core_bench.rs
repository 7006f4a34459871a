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

use ndarray as nd;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rustronomy_propagate::prelude::*;

#[test]
fn core_bench() {
  //Create a random uniform field
  let rf = nd::Array2::<f64>::random((512, 512), Uniform::new(1.0, 254.0));

  //Set-up the propagation transform
  let propagation = TransformBuilder::new().set_lambda(0.05).set_radius(1).build().unwrap();

  //Seed every local maximum of the random field
  let seeds = propagation.find_local_maxima(rf.view());
  let labels = propagation.labels_from_seeds(rf.dim(), &seeds);
  let refs = propagation.reference_intensities(rf.view(), &seeds, 1);
  let mask = nd::Array2::from_elem(rf.dim(), true);

  //Time the transform
  let start = std::time::Instant::now();
  let segmentation =
    propagation.propagate(rf.view(), labels.view(), mask.view(), &refs).unwrap();
  let elapsed = start.elapsed().as_secs_f64();

  println!("Propagated {} seeds over a {:?} px field in {elapsed:000.02}s", seeds.len(), rf.dim());
  println!(
    "{} difference evaluations, {} frontier pops",
    segmentation.stats.difference_evaluations, segmentation.stats.frontier_pops
  );

  //Every masked pixel is 8-connected to some seed, so nothing stays background
  assert!(segmentation.labels.iter().all(|&label| label != 0));
}
