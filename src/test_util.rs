#![cfg(test)]
use crate::NNIFFloat;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::Axis;
use proptest::arbitrary::functor::ArbitraryF1;
use proptest::prelude::*;
use proptest::sample::SizeRange;

prop_compose! {
    pub fn array1(len: usize)(v in Vec::lift1_with(-10. .. 10., SizeRange::new(len..=len))) -> Array1<NNIFFloat> {
        Array1::from_vec(v)
    }
}

prop_compose! {
    pub fn array2(rows: usize, cols: usize)(v in Vec::lift1_with(array1(cols), SizeRange::new(rows..=rows))) -> Array2<NNIFFloat> {
        assert!(rows > 0);
        ndarray::stack(Axis(0), &v.iter().map(|x| x.view()).collect::<Vec<ArrayView1<NNIFFloat>>>()).unwrap()
    }
}

prop_compose! {
    pub fn labels1(len: usize, num_classes: usize)(v in Vec::lift1_with(0..num_classes, SizeRange::new(len..=len))) -> Array1<usize> {
        Array1::from_vec(v)
    }
}
